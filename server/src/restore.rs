//! Restoring a share file: locate the recipe through the inode index, walk
//! its entries, gather share bodies through a small container cache, and
//! stream the result to the client in batches.

use std::fs;
use std::io::Read;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use cirrus_wire::metadata::{ShareFileHead, ShareRecord, SHARE_RECORD_SIZE};

use crate::buffers::{CONTAINER_BUFFER_SIZE, RECIPE_BUFFER_SIZE};
use crate::dedup::{canonical_name, inode_fp, inode_key, share_key, DedupEngine};
use crate::layout::{
    InodeValue, RecipeEntry, RecipeHead, ShareValue, RECIPE_ENTRY_SIZE, RECIPE_HEAD_SIZE,
};
use crate::names::ArchiveName;
use crate::Error;

/// Capacity of one streamed restore batch.
pub const SHARE_FILE_BUFFER_SIZE: usize = 4 << 20;
/// Containers kept hot during one restore.
pub const CACHED_CONTAINERS: usize = 4;

impl DedupEngine {
    /// Restore one version of a file (`0` the newest, `-v` an older one)
    /// and hand the share stream to `tx` batch by batch: the first batch
    /// starts with the share-file head, every share is a record followed by
    /// its body. Blocking; run under `spawn_blocking` with an async
    /// consumer on the channel.
    #[instrument(skip_all, fields(user_id = user_id, version = version))]
    pub fn restore_share_file(
        &self,
        user_id: u32,
        version: i32,
        raw_name: &[u8],
        tx: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), Error> {
        if version > 0 {
            return Err(Error::InvalidRequest(
                "version numbers are zero or negative".into(),
            ));
        }

        let name = canonical_name(raw_name)?;
        let fp = inode_fp(&name, user_id);
        let raw = self
            .get_value(&inode_key(&fp))?
            .ok_or_else(|| Error::NotFound(format!("no file indexed under fingerprint {}", fp)))?;
        let file = match InodeValue::decode(&raw)? {
            InodeValue::File(file) => file,
            InodeValue::Dir(_) => {
                return Err(Error::InvalidRequest("cannot restore a directory".into()))
            }
        };

        let slot = version.unsigned_abs() as usize;
        let wanted = file.versions.get(slot).ok_or_else(|| {
            Error::NotFound(format!(
                "version {} of a file with {} versions",
                version,
                file.versions.len()
            ))
        })?;

        // Prefer the user's live recipe buffer over the sealed file.
        let mut reader = match self.pool.snapshot_recipe(user_id, &wanted.recipe_file) {
            Some(buffer) => RecipeReader::from_memory(buffer, wanted.recipe_offset as usize)?,
            None => {
                let file = match &self.recipe_tier {
                    Some(tier) => tier.open_old_file(wanted.recipe_file.as_str())?,
                    None => fs::File::open(self.recipe_dir.join(wanted.recipe_file.as_str()))?,
                };
                RecipeReader::from_file(file, wanted.recipe_offset as usize)?
            }
        };

        let mut head_bytes = [0u8; RECIPE_HEAD_SIZE];
        reader.read_exact(&mut head_bytes)?;
        let head = RecipeHead::decode(&head_bytes)?;
        debug!(shares = head.share_count, file_size = head.file_size, "restoring share file");

        let mut cache: LruCache<ArchiveName, Vec<u8>> =
            LruCache::new(NonZeroUsize::new(CACHED_CONTAINERS).expect("cache capacity is non-zero"));
        let mut batch = Vec::with_capacity(SHARE_FILE_BUFFER_SIZE);
        ShareFileHead {
            file_size: head.file_size,
            share_count: head.share_count,
        }
        .encode(&mut batch);

        for _ in 0..head.share_count {
            let mut entry_bytes = [0u8; RECIPE_ENTRY_SIZE];
            reader.read_exact(&mut entry_bytes)?;
            let entry = RecipeEntry::decode(&entry_bytes)?;

            let raw = self.get_value(&share_key(&entry.fp))?.ok_or_else(|| {
                Error::NotFound(format!("no share indexed under fingerprint {}", entry.fp))
            })?;
            let share = ShareValue::decode(&raw)?;

            let share_size = usize::try_from(share.share_size)
                .map_err(|_| Error::Corrupt("negative share size in index".into()))?;
            let offset = usize::try_from(share.container_offset)
                .map_err(|_| Error::Corrupt("negative container offset in index".into()))?;

            if batch.len() + SHARE_RECORD_SIZE + share_size > SHARE_FILE_BUFFER_SIZE {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(SHARE_FILE_BUFFER_SIZE));
                tx.blocking_send(full)
                    .map_err(|_| Error::StorageError("restore stream consumer is gone".into()))?;
            }

            if !cache.contains(&share.container) {
                let data = self.load_container(&share.container)?;
                cache.put(share.container, data);
            }
            let container = cache
                .get(&share.container)
                .expect("container was just inserted");
            let body = container.get(offset..offset + share_size).ok_or_else(|| {
                Error::Corrupt(format!(
                    "share at {}+{} exceeds container {}",
                    offset, share_size, share.container
                ))
            })?;

            ShareRecord {
                secret_id: entry.secret_id,
                secret_size: entry.secret_size,
                share_size: share.share_size,
            }
            .encode(&mut batch);
            batch.extend_from_slice(body);
        }

        if !batch.is_empty() {
            tx.blocking_send(batch)
                .map_err(|_| Error::StorageError("restore stream consumer is gone".into()))?;
        }
        Ok(())
    }

    /// One container's bytes, from a live buffer if any user still holds it,
    /// else from disk (through the cold tier when configured).
    fn load_container(&self, name: &ArchiveName) -> Result<Vec<u8>, Error> {
        if let Some(buffer) = self.pool.snapshot_container(name) {
            return Ok(buffer);
        }
        let mut file = match &self.container_tier {
            Some(tier) => tier.open_old_file(name.as_str())?,
            None => fs::File::open(self.container_dir.join(name.as_str()))?,
        };
        let mut data = vec![0u8; CONTAINER_BUFFER_SIZE];
        let valid = read_into(&mut file, &mut data)?;
        data.truncate(valid);
        Ok(data)
    }
}

/// Windowed reader over a recipe source. A live-buffer snapshot is fully in
/// memory; a sealed recipe file is read through a window of
/// [RECIPE_BUFFER_SIZE] bytes that is refilled as the walk proceeds (a
/// recipe grown by cross-round appends can exceed the window).
struct RecipeReader {
    file: Option<fs::File>,
    window: Vec<u8>,
    valid: usize,
    pos: usize,
}

impl RecipeReader {
    fn from_memory(buffer: Vec<u8>, offset: usize) -> Result<Self, Error> {
        if offset > buffer.len() {
            return Err(Error::Corrupt("recipe offset beyond live buffer".into()));
        }
        Ok(RecipeReader {
            file: None,
            valid: buffer.len(),
            window: buffer,
            pos: offset,
        })
    }

    fn from_file(mut file: fs::File, offset: usize) -> Result<Self, Error> {
        // Recipe heads always lie within the first window; only appended
        // entries can push a recipe past it.
        let mut window = vec![0u8; RECIPE_BUFFER_SIZE];
        let valid = read_into(&mut file, &mut window)?;
        if offset > valid {
            return Err(Error::Corrupt("recipe offset beyond recipe file".into()));
        }
        Ok(RecipeReader {
            file: Some(file),
            window,
            valid,
            pos: offset,
        })
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<(), Error> {
        if self.pos + out.len() > self.valid {
            match &mut self.file {
                None => return Err(Error::Corrupt("recipe truncated in live buffer".into())),
                Some(file) => {
                    // Slide the unread tail to the front and refill.
                    self.window.copy_within(self.pos..self.valid, 0);
                    let tail = self.valid - self.pos;
                    let read = read_into(file, &mut self.window[tail..])?;
                    self.valid = tail + read;
                    self.pos = 0;
                    if out.len() > self.valid {
                        return Err(Error::Corrupt("recipe file truncated".into()));
                    }
                }
            }
        }
        out.copy_from_slice(&self.window[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}

/// Read until `buf` is full or the source is exhausted; returns bytes read.
fn read_into(file: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
