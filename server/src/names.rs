//! Names of the on-disk archives (recipe files and share containers).
//!
//! A name is the 15-character string of 12 lowercase letters followed by
//! `.rf` or `.sc`; index values embed it NUL-padded to a fixed 16-byte
//! field. Names are allocated from a global, lexicographically increasing
//! counter per archive kind, so a name is used for exactly one immutable
//! file for the lifetime of the system.

use std::path::Path;

use thiserror::Error;

/// Total name length, including the dot-suffix.
pub const ARCHIVE_NAME_LEN: usize = 16;
/// Length of the counted part of the name, excluding the suffix.
pub const ARCHIVE_NAME_VALID_LEN: usize = 12;

/// Suffix of recipe files.
pub const RECIPE_SUFFIX: &str = ".rf";
/// Suffix of share containers.
pub const CONTAINER_SUFFIX: &str = ".sc";

#[derive(Debug, Error)]
pub enum NameError {
    #[error("archive name space exhausted")]
    Exhausted,

    #[error("invalid archive name")]
    Invalid,
}

/// A 16-byte archive file name: the 15-character string
/// `<12 letters><.rf|.sc>` plus a trailing NUL. The padded form is what the
/// index values embed; the string form is the on-disk file name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveName([u8; ARCHIVE_NAME_LEN]);

/// Length of the string form, excluding the trailing NUL.
const ARCHIVE_NAME_STR_LEN: usize = ARCHIVE_NAME_LEN - 1;

impl ArchiveName {
    /// The padded 16-byte form embedded in index values.
    pub fn as_bytes(&self) -> &[u8; ARCHIVE_NAME_LEN] {
        &self.0
    }

    /// The name as a path component. Names only ever contain lowercase
    /// letters and the dot-suffix.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0[..ARCHIVE_NAME_STR_LEN]).expect("archive names are ASCII")
    }

    fn first(suffix: &str) -> ArchiveName {
        let mut buf = [0u8; ARCHIVE_NAME_LEN];
        buf[..ARCHIVE_NAME_VALID_LEN].fill(b'a');
        buf[ARCHIVE_NAME_VALID_LEN..ARCHIVE_NAME_STR_LEN].copy_from_slice(suffix.as_bytes());
        ArchiveName(buf)
    }

    fn is_valid(&self, suffix: &str) -> bool {
        self.0[..ARCHIVE_NAME_VALID_LEN]
            .iter()
            .all(|b| b.is_ascii_lowercase())
            && &self.0[ARCHIVE_NAME_VALID_LEN..ARCHIVE_NAME_STR_LEN] == suffix.as_bytes()
            && self.0[ARCHIVE_NAME_STR_LEN] == 0
    }
}

impl TryFrom<&[u8]> for ArchiveName {
    type Error = NameError;

    /// Accepts both forms: the 15-byte string (an on-disk file name) and
    /// the NUL-padded 16-byte field of an index value.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut buf = [0u8; ARCHIVE_NAME_LEN];
        match value.len() {
            ARCHIVE_NAME_STR_LEN => buf[..ARCHIVE_NAME_STR_LEN].copy_from_slice(value),
            ARCHIVE_NAME_LEN => {
                if value[ARCHIVE_NAME_STR_LEN] != 0 {
                    return Err(NameError::Invalid);
                }
                buf.copy_from_slice(value);
            }
            _ => return Err(NameError::Invalid),
        }
        if !buf[..ARCHIVE_NAME_STR_LEN].is_ascii() {
            return Err(NameError::Invalid);
        }
        Ok(ArchiveName(buf))
    }
}

impl std::fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ArchiveName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocator for one archive kind. Wrap it in a mutex; allocation must be
/// globally serialized per kind.
pub struct NameAllocator {
    /// None once the name space is used up.
    next: Option<ArchiveName>,
    suffix: &'static str,
}

impl NameAllocator {
    pub fn new(suffix: &'static str) -> Self {
        NameAllocator {
            next: Some(ArchiveName::first(suffix)),
            suffix,
        }
    }

    /// An allocator that resumes past the lexicographically largest name
    /// already present in `dir`, so a restarted server never reuses a name.
    pub fn resuming_from_dir(dir: &Path, suffix: &'static str) -> std::io::Result<Self> {
        let mut max: Option<ArchiveName> = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Ok(name) = ArchiveName::try_from(name.as_encoded_bytes()) {
                if name.is_valid(suffix) && Some(name) > max {
                    max = Some(name);
                }
            }
        }

        let mut alloc = NameAllocator::new(suffix);
        if let Some(max) = max {
            // Skip past the largest existing name.
            alloc.next = increment(max);
        }
        Ok(alloc)
    }

    /// Take the next free name and advance the counter.
    pub fn allocate(&mut self) -> Result<ArchiveName, NameError> {
        let current = self.next.ok_or(NameError::Exhausted)?;
        self.next = increment(current);

        debug_assert!(current.is_valid(self.suffix));
        Ok(current)
    }
}

/// The lexicographic successor within `{a..z}^12`, or None after the last
/// name.
fn increment(name: ArchiveName) -> Option<ArchiveName> {
    let mut buf = *name.as_bytes();
    let mut i = ARCHIVE_NAME_VALID_LEN;
    while i > 0 && buf[i - 1] == b'z' {
        i -= 1;
    }
    if i == 0 {
        return None;
    }
    buf[i - 1] += 1;
    for b in &mut buf[i..ARCHIVE_NAME_VALID_LEN] {
        *b = b'a';
    }
    Some(ArchiveName(buf))
}
