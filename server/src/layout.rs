//! Serialized layouts of everything the server persists: inode values and
//! share values in the key-value index, and the recipe records written into
//! recipe files. All integers little endian, byte-exact.

use thiserror::Error;

use cirrus_dispersal::{Fingerprint, FINGERPRINT_LEN};

use crate::names::{ArchiveName, ARCHIVE_NAME_LEN};

/// Serialized size of a [RecipeHead].
pub const RECIPE_HEAD_SIZE: usize = 16;
/// Serialized size of a [RecipeEntry].
pub const RECIPE_ENTRY_SIZE: usize = FINGERPRINT_LEN + 8;

const INODE_HEAD_SIZE: usize = 13;
const SHARE_HEAD_SIZE: usize = ARCHIVE_NAME_LEN + 12;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("value truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid inode kind {0}")]
    InvalidKind(u8),

    #[error("invalid count {0}")]
    InvalidCount(i64),

    #[error("invalid archive name in value")]
    InvalidName,
}

/// An inode value: either a directory listing child inode fingerprints, or a
/// file listing its versions, newest first.
///
/// Layout: `{ user_id: i32, short_name_len: i32, kind: u8, child_count: i32 }
/// ‖ short_name ‖ children`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeValue {
    Dir(DirInode),
    File(FileInode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInode {
    pub user_id: u32,
    pub short_name: Vec<u8>,
    pub children: Vec<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInode {
    pub user_id: u32,
    pub short_name: Vec<u8>,
    /// Newest version first.
    pub versions: Vec<FileVersion>,
}

/// Where one version of a file's recipe starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion {
    pub recipe_file: ArchiveName,
    pub recipe_offset: i32,
}

const KIND_DIR: u8 = 0;
const KIND_FILE: u8 = 1;

impl InodeValue {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            InodeValue::Dir(dir) => {
                let mut out = Vec::with_capacity(
                    INODE_HEAD_SIZE + dir.short_name.len() + dir.children.len() * FINGERPRINT_LEN,
                );
                encode_inode_head(
                    &mut out,
                    dir.user_id,
                    &dir.short_name,
                    KIND_DIR,
                    dir.children.len() as i32,
                );
                for child in &dir.children {
                    out.extend_from_slice(child.as_slice());
                }
                out
            }
            InodeValue::File(file) => {
                let mut out = Vec::with_capacity(
                    INODE_HEAD_SIZE + file.short_name.len() + file.versions.len() * (ARCHIVE_NAME_LEN + 4),
                );
                encode_inode_head(
                    &mut out,
                    file.user_id,
                    &file.short_name,
                    KIND_FILE,
                    file.versions.len() as i32,
                );
                for v in &file.versions {
                    out.extend_from_slice(v.recipe_file.as_bytes());
                    out.extend_from_slice(&v.recipe_offset.to_le_bytes());
                }
                out
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let mut cur = Cursor { buf, pos: 0 };
        let user_id = cur.read_i32()? as u32;
        let name_len = cur.read_i32()?;
        let kind = cur.read_u8()?;
        let count = cur.read_i32()?;
        if name_len < 0 {
            return Err(LayoutError::InvalidCount(name_len as i64));
        }
        if count < 0 {
            return Err(LayoutError::InvalidCount(count as i64));
        }
        let short_name = cur.read_bytes(name_len as usize)?.to_vec();

        match kind {
            KIND_DIR => {
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    children.push(
                        Fingerprint::try_from(cur.read_bytes(FINGERPRINT_LEN)?)
                            .expect("fingerprint length is fixed"),
                    );
                }
                Ok(InodeValue::Dir(DirInode {
                    user_id,
                    short_name,
                    children,
                }))
            }
            KIND_FILE => {
                let mut versions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let recipe_file = ArchiveName::try_from(cur.read_bytes(ARCHIVE_NAME_LEN)?)
                        .map_err(|_| LayoutError::InvalidName)?;
                    versions.push(FileVersion {
                        recipe_file,
                        recipe_offset: cur.read_i32()?,
                    });
                }
                Ok(InodeValue::File(FileInode {
                    user_id,
                    short_name,
                    versions,
                }))
            }
            other => Err(LayoutError::InvalidKind(other)),
        }
    }
}

fn encode_inode_head(out: &mut Vec<u8>, user_id: u32, short_name: &[u8], kind: u8, count: i32) {
    out.extend_from_slice(&(user_id as i32).to_le_bytes());
    out.extend_from_slice(&(short_name.len() as i32).to_le_bytes());
    out.push(kind);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(short_name);
}

/// A share value: where the share body lives and which users reference it.
///
/// Layout: `{ container_name: [u8; 16], container_offset: i32,
/// share_size: i32, user_count: i32 } ‖ user_count x { user_id: i32,
/// ref_count: i32 }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareValue {
    pub container: ArchiveName,
    pub container_offset: i32,
    pub share_size: i32,
    pub refs: Vec<UserRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: u32,
    pub ref_count: i32,
}

impl ShareValue {
    /// Whether `user_id` already references this share; used for the
    /// intra-user duplicate decision.
    pub fn owned_by(&self, user_id: u32) -> bool {
        self.refs.iter().any(|r| r.user_id == user_id)
    }

    /// Bump the reference count of `user_id`, or append a fresh entry.
    pub fn add_ref(&mut self, user_id: u32) {
        match self.refs.iter_mut().find(|r| r.user_id == user_id) {
            Some(r) => r.ref_count += 1,
            None => self.refs.push(UserRef {
                user_id,
                ref_count: 1,
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SHARE_HEAD_SIZE + self.refs.len() * 8);
        out.extend_from_slice(self.container.as_bytes());
        out.extend_from_slice(&self.container_offset.to_le_bytes());
        out.extend_from_slice(&self.share_size.to_le_bytes());
        out.extend_from_slice(&(self.refs.len() as i32).to_le_bytes());
        for r in &self.refs {
            out.extend_from_slice(&(r.user_id as i32).to_le_bytes());
            out.extend_from_slice(&r.ref_count.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let mut cur = Cursor { buf, pos: 0 };
        let container = ArchiveName::try_from(cur.read_bytes(ARCHIVE_NAME_LEN)?)
            .map_err(|_| LayoutError::InvalidName)?;
        let container_offset = cur.read_i32()?;
        let share_size = cur.read_i32()?;
        let user_count = cur.read_i32()?;
        if user_count < 0 {
            return Err(LayoutError::InvalidCount(user_count as i64));
        }
        let mut refs = Vec::with_capacity(user_count as usize);
        for _ in 0..user_count {
            refs.push(UserRef {
                user_id: cur.read_i32()? as u32,
                ref_count: cur.read_i32()?,
            });
        }
        Ok(ShareValue {
            container,
            container_offset,
            share_size,
            refs,
        })
    }
}

/// Head of one file's record inside a recipe file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipeHead {
    pub user_id: u32,
    pub file_size: i64,
    pub share_count: i32,
}

impl RecipeHead {
    pub fn encode_into(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&(self.user_id as i32).to_le_bytes());
        out[4..12].copy_from_slice(&self.file_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.share_count.to_le_bytes());
    }

    pub fn encode(&self) -> [u8; RECIPE_HEAD_SIZE] {
        let mut out = [0u8; RECIPE_HEAD_SIZE];
        self.encode_into(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let mut cur = Cursor { buf, pos: 0 };
        Ok(RecipeHead {
            user_id: cur.read_i32()? as u32,
            file_size: cur.read_i64()?,
            share_count: cur.read_i32()?,
        })
    }
}

/// One share reference inside a recipe file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipeEntry {
    pub fp: Fingerprint,
    pub secret_id: i32,
    pub secret_size: i32,
}

impl RecipeEntry {
    pub fn encode(&self) -> [u8; RECIPE_ENTRY_SIZE] {
        let mut out = [0u8; RECIPE_ENTRY_SIZE];
        out[..FINGERPRINT_LEN].copy_from_slice(self.fp.as_slice());
        out[FINGERPRINT_LEN..FINGERPRINT_LEN + 4].copy_from_slice(&self.secret_id.to_le_bytes());
        out[FINGERPRINT_LEN + 4..].copy_from_slice(&self.secret_size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        let mut cur = Cursor { buf, pos: 0 };
        Ok(RecipeEntry {
            fp: Fingerprint::try_from(cur.read_bytes(FINGERPRINT_LEN)?)
                .expect("fingerprint length is fixed"),
            secret_id: cur.read_i32()?,
            secret_size: cur.read_i32()?,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], LayoutError> {
        if self.pos + n > self.buf.len() {
            return Err(LayoutError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, LayoutError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32, LayoutError> {
        Ok(i32::from_le_bytes(
            self.read_bytes(4)?.try_into().expect("checked length"),
        ))
    }

    fn read_i64(&mut self) -> Result<i64, LayoutError> {
        Ok(i64::from_le_bytes(
            self.read_bytes(8)?.try_into().expect("checked length"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn name(s: &str) -> ArchiveName {
        ArchiveName::try_from(s.as_bytes()).unwrap()
    }

    #[test]
    fn file_inode_roundtrip() {
        let inode = InodeValue::File(FileInode {
            user_id: 42,
            short_name: b"report.txt".to_vec(),
            versions: vec![
                FileVersion {
                    recipe_file: name("aaaaaaaaaaab.rf"),
                    recipe_offset: 1024,
                },
                FileVersion {
                    recipe_file: name("aaaaaaaaaaaa.rf"),
                    recipe_offset: 0,
                },
            ],
        });
        assert_eq!(InodeValue::decode(&inode.encode()).unwrap(), inode);
    }

    #[test]
    fn dir_inode_roundtrip() {
        let inode = InodeValue::Dir(DirInode {
            user_id: 7,
            short_name: b"docs/".to_vec(),
            children: vec![Fingerprint::from([1u8; 32]), Fingerprint::from([2u8; 32])],
        });
        assert_eq!(InodeValue::decode(&inode.encode()).unwrap(), inode);
    }

    #[test]
    fn share_value_roundtrip() {
        let value = ShareValue {
            container: name("aaaaaaaaaaca.sc"),
            container_offset: 65536,
            share_size: 1412,
            refs: vec![
                UserRef {
                    user_id: 1,
                    ref_count: 3,
                },
                UserRef {
                    user_id: 9,
                    ref_count: 1,
                },
            ],
        };
        assert_eq!(ShareValue::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn share_value_ref_updates() {
        let mut value = ShareValue {
            container: name("aaaaaaaaaaaa.sc"),
            container_offset: 0,
            share_size: 64,
            refs: vec![UserRef {
                user_id: 1,
                ref_count: 1,
            }],
        };
        assert!(value.owned_by(1));
        assert!(!value.owned_by(2));

        value.add_ref(1);
        assert_eq!(value.refs[0].ref_count, 2);

        value.add_ref(2);
        assert_eq!(value.refs.len(), 2);
        assert!(value.owned_by(2));
    }

    #[test]
    fn recipe_head_layout_is_byte_exact() {
        let head = RecipeHead {
            user_id: 3,
            file_size: 0x0a0b,
            share_count: 2,
        };
        assert_eq!(
            head.encode(),
            hex!("03000000" "0b0a000000000000" "02000000")
        );
        assert_eq!(RecipeHead::decode(&head.encode()).unwrap(), head);
    }

    #[test]
    fn recipe_entry_roundtrip() {
        let entry = RecipeEntry {
            fp: Fingerprint::from([0xcd; 32]),
            secret_id: 17,
            secret_size: 8192,
        };
        let encoded = entry.encode();
        assert_eq!(encoded.len(), RECIPE_ENTRY_SIZE);
        assert_eq!(RecipeEntry::decode(&encoded).unwrap(), entry);
    }

    #[test]
    fn truncated_values_are_rejected() {
        let inode = InodeValue::File(FileInode {
            user_id: 1,
            short_name: b"f".to_vec(),
            versions: vec![FileVersion {
                recipe_file: name("aaaaaaaaaaaa.rf"),
                recipe_offset: 0,
            }],
        });
        let encoded = inode.encode();
        assert!(InodeValue::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(ShareValue::decode(&[0u8; 10]).is_err());
    }
}
