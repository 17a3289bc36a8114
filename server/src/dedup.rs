//! The two-stage deduplication engine.
//!
//! Stage one answers a duplicate bitmap from share metadata alone, so the
//! client only transmits bodies the server has never stored for that user.
//! Stage two verifies and ingests those bodies: inter-user index updates,
//! appends into the per-user container buffer, and recipe records into the
//! per-user recipe buffer, sealing either buffer into a freshly named
//! archive file when it fills up.
//!
//! File identity: the client never reveals the plaintext path. What arrives
//! is one dispersal-encoded name share, which this server canonicalizes and
//! uses as an opaque per-cloud identifier: the FILE inode is keyed by
//! `SHA-256(identifier ‖ user_id)` and ancestor directories are derived from
//! the identifier's `/`-separated components. Convergent encoding keeps the
//! identifier stable across uploads and downloads of the same path. The
//! alternative of shipping all `n` name shares out of band was considered
//! and rejected; see DESIGN.md.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, instrument, warn};

use cirrus_dispersal::crypto::sha256_fingerprint;
use cirrus_dispersal::{Fingerprint, FINGERPRINT_LEN};
use cirrus_wire::metadata::{self, FileGroup};

use crate::buffers::{BufferPool, UserBuffer, CONTAINER_BUFFER_SIZE, MAX_BUFFER_WAIT, RECIPE_BUFFER_SIZE};
use crate::coldtier::ColdTier;
use crate::layout::{
    DirInode, FileInode, FileVersion, InodeValue, RecipeEntry, RecipeHead, ShareValue, UserRef,
    RECIPE_ENTRY_SIZE, RECIPE_HEAD_SIZE,
};
use crate::names::{ArchiveName, NameAllocator, CONTAINER_SUFFIX, RECIPE_SUFFIX};
use crate::Error;

/// The single ordered key-value table. The first key byte selects the
/// namespace: `'0'` for inode values, `'1'` for share values; the remaining
/// 32 bytes are the fingerprint.
const DEDUP_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("dedup");

const INODE_PREFIX: u8 = b'0';
const SHARE_PREFIX: u8 = b'1';

pub(crate) const KEY_SIZE: usize = FINGERPRINT_LEN + 1;

/// The answer of the first dedup stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstStageReply {
    /// One flag per share of the round, true meaning "duplicate, skip".
    pub duplicates: Vec<bool>,
    /// Bytes the client is expected to transmit in the `DATA` frame.
    pub data_bytes: u64,
}

pub struct DedupEngine {
    pub(crate) db: Database,
    pub(crate) recipe_dir: PathBuf,
    pub(crate) container_dir: PathBuf,
    pub(crate) pool: BufferPool,
    recipe_names: Mutex<NameAllocator>,
    container_names: Mutex<NameAllocator>,
    pub(crate) recipe_tier: Option<Arc<ColdTier>>,
    pub(crate) container_tier: Option<Arc<ColdTier>>,
}

impl DedupEngine {
    /// Open (or create) the engine state under `root`: the key-value index
    /// in `root/DedupDB`, recipe files in `root/RecipeFiles`, and share
    /// containers in `root/ShareContainers`.
    pub fn open(root: &Path) -> Result<Self, Error> {
        Self::open_with(root, MAX_BUFFER_WAIT, None, None)
    }

    pub fn open_with(
        root: &Path,
        max_idle: Duration,
        recipe_tier: Option<Arc<ColdTier>>,
        container_tier: Option<Arc<ColdTier>>,
    ) -> Result<Self, Error> {
        let db_dir = root.join("DedupDB");
        let recipe_dir = root.join("RecipeFiles");
        let container_dir = root.join("ShareContainers");
        fs::create_dir_all(&db_dir)?;
        fs::create_dir_all(&recipe_dir)?;
        fs::create_dir_all(&container_dir)?;

        let db = Database::create(db_dir.join("index.redb"))?;
        let txn = db.begin_write()?;
        txn.open_table(DEDUP_TABLE)?;
        txn.commit()?;

        // Resume the name counters past whatever a previous run left on
        // disk, so names stay unique across restarts.
        let recipe_names = NameAllocator::resuming_from_dir(&recipe_dir, RECIPE_SUFFIX)?;
        let container_names = NameAllocator::resuming_from_dir(&container_dir, CONTAINER_SUFFIX)?;

        Ok(DedupEngine {
            db,
            recipe_dir,
            container_dir,
            pool: BufferPool::new(max_idle),
            recipe_names: Mutex::new(recipe_names),
            container_names: Mutex::new(container_names),
            recipe_tier,
            container_tier,
        })
    }

    /// First stage: walk the metadata only and answer the duplicate bitmap.
    /// Intra-user duplicates get their reference count bumped in place; no
    /// share data is consumed.
    #[instrument(skip_all, fields(user_id = user_id))]
    pub fn first_stage(&self, user_id: u32, meta: &[u8]) -> Result<FirstStageReply, Error> {
        let groups = metadata::parse_metadata(meta)?;

        let mut duplicates = Vec::new();
        let mut data_bytes = 0u64;
        for group in &groups {
            for entry in &group.entries {
                let dup = self.intra_user_update(&entry.fp, user_id)?;
                if !dup {
                    data_bytes += u64::try_from(entry.share_size)
                        .map_err(|_| Error::InvalidRequest("negative share size".into()))?;
                }
                duplicates.push(dup);
            }
        }

        debug!(
            shares = duplicates.len(),
            dups = duplicates.iter().filter(|&&d| d).count(),
            data_bytes,
            "first-stage dedup answered"
        );
        Ok(FirstStageReply {
            duplicates,
            data_bytes,
        })
    }

    /// Second stage: ingest the bodies of all non-duplicate shares of the
    /// round, verifying each against its announced fingerprint, and extend
    /// the user's recipe buffer with one entry per share (duplicate or not).
    #[instrument(skip_all, fields(user_id = user_id, data_len = data.len()))]
    pub fn second_stage(
        &self,
        user_id: u32,
        meta: &[u8],
        duplicates: &[bool],
        data: &[u8],
    ) -> Result<(), Error> {
        let groups = metadata::parse_metadata(meta)?;

        let (mut buffer, evicted) = self.pool.checkout(user_id, || self.new_buffer(user_id))?;
        for mut stale in evicted {
            if let Err(e) = self.flush_buffer(&mut stale) {
                warn!(user_id = stale.user_id, err = %e, "failed to flush evicted buffer");
            }
        }

        let result = self.ingest(user_id, &groups, duplicates, data, &mut buffer);
        self.pool.checkin(buffer);
        result
    }

    /// Flush and drop every live buffer; called on shutdown.
    pub fn flush_all(&self) -> Result<(), Error> {
        for mut buffer in self.pool.take_all() {
            self.flush_buffer(&mut buffer)?;
        }
        Ok(())
    }

    /// Flush and drop buffers idle beyond the configured limit.
    pub fn flush_idle(&self) {
        for mut buffer in self.pool.take_idle() {
            debug!(user_id = buffer.user_id, "flushing idle user buffer");
            if let Err(e) = self.flush_buffer(&mut buffer) {
                warn!(user_id = buffer.user_id, err = %e, "failed to flush idle buffer");
            }
        }
    }

    fn new_buffer(&self, user_id: u32) -> Result<UserBuffer, Error> {
        let recipe_name = self
            .recipe_names
            .lock()
            .allocate()
            .map_err(|e| Error::StorageError(e.to_string()))?;
        let container_name = self
            .container_names
            .lock()
            .allocate()
            .map_err(|e| Error::StorageError(e.to_string()))?;
        Ok(UserBuffer::new(user_id, recipe_name, container_name))
    }

    fn ingest(
        &self,
        user_id: u32,
        groups: &[FileGroup],
        duplicates: &[bool],
        data: &[u8],
        buf: &mut UserBuffer,
    ) -> Result<(), Error> {
        let mut dup_idx = 0usize;
        let mut data_off = 0usize;

        for group in groups {
            let header = &group.header;
            let name = canonical_name(&group.name)?;

            // Room for this file's records. A fresh file (or an empty
            // buffer) needs a recipe head as well.
            let needed = if header.past_secrets == 0 || buf.recipe_buf.is_empty() {
                RECIPE_HEAD_SIZE + RECIPE_ENTRY_SIZE * group.entries.len()
            } else {
                RECIPE_ENTRY_SIZE * group.entries.len()
            };

            if buf.recipe_buf.len() + needed > RECIPE_BUFFER_SIZE {
                let prev_head = RecipeHead::decode(&buf.recipe_buf[buf.last_recipe_head_pos..])?;
                // When the buffer holds a single file whose earlier rounds
                // already went into a previous recipe file, keep appending
                // there instead of opening a new archive.
                let sealed = if buf.last_recipe_head_pos == 0
                    && header.past_secrets > prev_head.share_count
                {
                    self.append_old_recipe(buf)?
                } else {
                    self.seal_new_recipe(buf)?
                };
                if header.past_secrets == 0 {
                    // A new file starting means the previous one is done.
                    if let Some(tier) = &self.recipe_tier {
                        tier.add_new_file(sealed.as_str());
                    }
                }
            }

            if header.past_secrets == 0 {
                // New file: index it (the version entry points at the head
                // we are about to write) and lay down a fresh recipe head.
                self.add_file_to_inode_index(&name, user_id, buf)?;
                self.push_fresh_head(buf, user_id, header.file_size, header.coming_secrets);
                buf.last_inode_fp = Some(inode_fp(&name, user_id));
            } else if buf.recipe_buf.is_empty() {
                // Continuation of a file whose earlier records were sealed.
                self.push_fresh_head(buf, user_id, header.file_size, header.coming_secrets);
                buf.last_inode_fp = Some(inode_fp(&name, user_id));
            } else {
                // Continuation within the same buffer: extend the head.
                let mut head = RecipeHead::decode(&buf.recipe_buf[buf.last_recipe_head_pos..])?;
                head.share_count += header.coming_secrets;
                head.encode_into(
                    &mut buf.recipe_buf
                        [buf.last_recipe_head_pos..buf.last_recipe_head_pos + RECIPE_HEAD_SIZE],
                );
            }

            for entry in &group.entries {
                let dup = duplicates.get(dup_idx).copied().ok_or_else(|| {
                    Error::InvalidRequest("duplicate bitmap shorter than metadata".into())
                })?;
                dup_idx += 1;

                if !dup {
                    let share_size = usize::try_from(entry.share_size)
                        .map_err(|_| Error::InvalidRequest("negative share size".into()))?;
                    let body = data.get(data_off..data_off + share_size).ok_or_else(|| {
                        Error::InvalidRequest("share data shorter than metadata".into())
                    })?;
                    if sha256_fingerprint(body) != entry.fp {
                        return Err(Error::Corrupt(format!(
                            "share body does not match its fingerprint (secret {})",
                            entry.secret_id
                        )));
                    }
                    self.inter_user_update(&entry.fp, user_id, entry.share_size, buf, body)?;
                    data_off += share_size;
                }

                buf.recipe_buf.extend_from_slice(
                    &RecipeEntry {
                        fp: entry.fp,
                        secret_id: entry.secret_id,
                        secret_size: entry.secret_size,
                    }
                    .encode(),
                );
            }

            // If the file is complete and its earlier records live in a
            // previous recipe file, fold the buffered tail back into it.
            if header.past_bytes + header.coming_bytes == header.file_size {
                let head = RecipeHead::decode(&buf.recipe_buf[buf.last_recipe_head_pos..])?;
                if buf.last_recipe_head_pos == 0 && header.past_secrets > head.share_count {
                    let sealed = self.append_old_recipe(buf)?;
                    if let Some(tier) = &self.recipe_tier {
                        tier.add_new_file(sealed.as_str());
                    }
                }
            }
        }

        Ok(())
    }

    /// Check whether `user_id` already references the share; bump its count
    /// if so. One write transaction per share keeps the read-modify-write
    /// atomic.
    fn intra_user_update(&self, fp: &Fingerprint, user_id: u32) -> Result<bool, Error> {
        let key = share_key(fp);
        let txn = self.db.begin_write()?;
        let dup;
        {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            let existing = table.get(key.as_slice())?.map(|g| g.value().to_vec());
            match existing {
                Some(raw) => {
                    let mut value = ShareValue::decode(&raw)?;
                    if value.owned_by(user_id) {
                        value.add_ref(user_id);
                        table.insert(key.as_slice(), value.encode().as_slice())?;
                        dup = true;
                    } else {
                        dup = false;
                    }
                }
                None => dup = false,
            }
        }
        txn.commit()?;
        Ok(dup)
    }

    /// Inter-user update for a share whose body just arrived: bump or extend
    /// the reference list if the share exists (another user uploaded it
    /// concurrently, or the round repeated a share), else stage the body
    /// into the container buffer and index it.
    fn inter_user_update(
        &self,
        fp: &Fingerprint,
        user_id: u32,
        share_size: i32,
        buf: &mut UserBuffer,
        body: &[u8],
    ) -> Result<(), Error> {
        let key = share_key(fp);

        let txn = self.db.begin_write()?;
        let mut existed = false;
        {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            let existing = table.get(key.as_slice())?.map(|g| g.value().to_vec());
            if let Some(raw) = existing {
                let mut value = ShareValue::decode(&raw)?;
                value.add_ref(user_id);
                table.insert(key.as_slice(), value.encode().as_slice())?;
                existed = true;
            }
        }
        txn.commit()?;
        if existed {
            return Ok(());
        }

        if buf.container_buf.len() + body.len() > CONTAINER_BUFFER_SIZE {
            let sealed = self.seal_container(buf)?;
            if let Some(tier) = &self.container_tier {
                tier.add_new_file(sealed.as_str());
            }
        }

        let value = ShareValue {
            container: buf.container_name,
            container_offset: buf.container_buf.len() as i32,
            share_size,
            refs: vec![UserRef {
                user_id,
                ref_count: 1,
            }],
        };
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            table.insert(key.as_slice(), value.encode().as_slice())?;
        }
        txn.commit()?;

        buf.container_buf.extend_from_slice(body);
        Ok(())
    }

    fn push_fresh_head(&self, buf: &mut UserBuffer, user_id: u32, file_size: i64, coming: i32) {
        buf.last_recipe_head_pos = buf.recipe_buf.len();
        buf.recipe_buf.extend_from_slice(
            &RecipeHead {
                user_id,
                file_size,
                share_count: coming,
            }
            .encode(),
        );
    }

    /// Write the recipe buffer to its archive file and rotate to a fresh
    /// name. Returns the sealed name.
    fn seal_new_recipe(&self, buf: &mut UserBuffer) -> Result<ArchiveName, Error> {
        let name = buf.recipe_name;
        fs::write(self.recipe_dir.join(name.as_str()), &buf.recipe_buf)?;
        debug!(name = %name, bytes = buf.recipe_buf.len(), "sealed recipe file");

        buf.recipe_name = self
            .recipe_names
            .lock()
            .allocate()
            .map_err(|e| Error::StorageError(e.to_string()))?;
        buf.recipe_buf.clear();
        buf.last_recipe_head_pos = 0;
        Ok(name)
    }

    /// Append the buffered recipe entries of a continuing file to the
    /// recipe file its earlier rounds were sealed into, and update that
    /// file's recipe head in place. The buffer keeps its name.
    fn append_old_recipe(&self, buf: &mut UserBuffer) -> Result<ArchiveName, Error> {
        let (name, offset) = self.find_old_recipe(buf)?;
        let path = self.recipe_dir.join(name.as_str());
        let mut file = fs::OpenOptions::new().read(true).write(true).open(&path)?;

        let buffered_head = RecipeHead::decode(&buf.recipe_buf)?;
        let mut disk_head = read_recipe_head(&mut file, offset)?;

        file.seek(SeekFrom::Start(
            offset + (RECIPE_HEAD_SIZE + RECIPE_ENTRY_SIZE * disk_head.share_count as usize) as u64,
        ))?;
        file.write_all(&buf.recipe_buf[RECIPE_HEAD_SIZE..])?;

        disk_head.share_count += buffered_head.share_count;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&disk_head.encode())?;
        debug!(name = %name, shares = disk_head.share_count, "appended to recipe file");

        buf.recipe_buf.clear();
        buf.last_recipe_head_pos = 0;
        Ok(name)
    }

    /// Write the container buffer to its archive file and rotate to a fresh
    /// name. Returns the sealed name.
    fn seal_container(&self, buf: &mut UserBuffer) -> Result<ArchiveName, Error> {
        let name = buf.container_name;
        fs::write(self.container_dir.join(name.as_str()), &buf.container_buf)?;
        debug!(name = %name, bytes = buf.container_buf.len(), "sealed share container");

        buf.container_name = self
            .container_names
            .lock()
            .allocate()
            .map_err(|e| Error::StorageError(e.to_string()))?;
        buf.container_buf.clear();
        Ok(name)
    }

    /// Persist whatever a buffer still holds. Used when evicting idle
    /// buffers and on shutdown; the buffer is dropped afterwards.
    pub(crate) fn flush_buffer(&self, buf: &mut UserBuffer) -> Result<(), Error> {
        if !buf.recipe_buf.is_empty() {
            if buf.last_recipe_head_pos == 0 {
                // The buffer holds a single file record; its head may
                // continue a file already rooted in an earlier recipe file.
                let (name, offset) = self.find_old_recipe(buf)?;
                let path = self.recipe_dir.join(name.as_str());
                let existing_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if existing_len == 0 {
                    if offset != 0 {
                        return Err(Error::Corrupt(format!(
                            "inode points at offset {} of missing recipe file {}",
                            offset, name
                        )));
                    }
                    fs::write(&path, &buf.recipe_buf)?;
                } else {
                    let mut file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
                    let buffered_head = RecipeHead::decode(&buf.recipe_buf)?;
                    let mut disk_head = read_recipe_head(&mut file, offset)?;
                    file.seek(SeekFrom::Start(
                        offset
                            + (RECIPE_HEAD_SIZE + RECIPE_ENTRY_SIZE * disk_head.share_count as usize)
                                as u64,
                    ))?;
                    file.write_all(&buf.recipe_buf[RECIPE_HEAD_SIZE..])?;
                    disk_head.share_count += buffered_head.share_count;
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(&disk_head.encode())?;
                }
                if let Some(tier) = &self.recipe_tier {
                    tier.add_new_file(name.as_str());
                }
            } else {
                fs::write(self.recipe_dir.join(buf.recipe_name.as_str()), &buf.recipe_buf)?;
                if let Some(tier) = &self.recipe_tier {
                    tier.add_new_file(buf.recipe_name.as_str());
                }
            }
            buf.recipe_buf.clear();
            buf.last_recipe_head_pos = 0;
        }

        if !buf.container_buf.is_empty() {
            fs::write(
                self.container_dir.join(buf.container_name.as_str()),
                &buf.container_buf,
            )?;
            if let Some(tier) = &self.container_tier {
                tier.add_new_file(buf.container_name.as_str());
            }
            buf.container_buf.clear();
        }

        Ok(())
    }

    /// The recipe file and offset holding the head of the most recent file
    /// this buffer touched, read from its FILE inode's newest version.
    fn find_old_recipe(&self, buf: &UserBuffer) -> Result<(ArchiveName, u64), Error> {
        let fp = buf
            .last_inode_fp
            .ok_or_else(|| Error::StorageError("buffer has no current file".into()))?;
        let key = inode_key(&fp);

        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEDUP_TABLE)?;
        let raw = table
            .get(key.as_slice())?
            .map(|g| g.value().to_vec())
            .ok_or_else(|| Error::NotFound(format!("no inode for fingerprint {}", fp)))?;
        match InodeValue::decode(&raw)? {
            InodeValue::File(file) => {
                let newest = file
                    .versions
                    .first()
                    .ok_or_else(|| Error::Corrupt("file inode without versions".into()))?;
                Ok((newest.recipe_file, newest.recipe_offset as u64))
            }
            InodeValue::Dir(_) => Err(Error::Corrupt("expected a file inode".into())),
        }
    }

    /// Record a new file (or a new version of it) in the inode index and
    /// register it with every ancestor directory up to the root.
    fn add_file_to_inode_index(
        &self,
        name: &[u8],
        user_id: u32,
        buf: &UserBuffer,
    ) -> Result<(), Error> {
        let slash = name
            .iter()
            .rposition(|&b| b == b'/')
            .expect("canonical names start with '/'");
        let file_fp = inode_fp(name, user_id);
        let version = FileVersion {
            recipe_file: buf.recipe_name,
            recipe_offset: buf.recipe_buf.len() as i32,
        };

        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            let key = inode_key(&file_fp);
            let existing = table.get(key.as_slice())?.map(|g| g.value().to_vec());
            match existing {
                Some(raw) => match InodeValue::decode(&raw)? {
                    InodeValue::File(mut file) => {
                        // Newest version first.
                        file.versions.insert(0, version);
                        table.insert(key.as_slice(), InodeValue::File(file).encode().as_slice())?;
                        existed = true;
                    }
                    InodeValue::Dir(_) => {
                        return Err(Error::InvalidRequest(
                            "name already indexed as a directory".into(),
                        ))
                    }
                },
                None => {
                    let inode = InodeValue::File(FileInode {
                        user_id,
                        short_name: name[slash + 1..].to_vec(),
                        versions: vec![version],
                    });
                    table.insert(key.as_slice(), inode.encode().as_slice())?;
                    existed = false;
                }
            }
        }
        txn.commit()?;

        if existed {
            // The directory chain was established by the first version.
            return Ok(());
        }

        // Walk the ancestor chain bottom-up, linking each level into its
        // parent and creating missing directory inodes.
        let mut child_fp = file_fp;
        let mut dir = name[..slash + 1].to_vec();
        loop {
            let dir_fp = inode_fp(&dir, user_id);
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(DEDUP_TABLE)?;
                let key = inode_key(&dir_fp);
                let existing = table.get(key.as_slice())?.map(|g| g.value().to_vec());
                match existing {
                    Some(raw) => match InodeValue::decode(&raw)? {
                        InodeValue::Dir(mut d) => {
                            if !d.children.contains(&child_fp) {
                                d.children.push(child_fp);
                                table.insert(key.as_slice(), InodeValue::Dir(d).encode().as_slice())?;
                            }
                        }
                        InodeValue::File(_) => {
                            return Err(Error::InvalidRequest(
                                "directory already indexed as a file".into(),
                            ))
                        }
                    },
                    None => {
                        let short_name = if dir == b"/" {
                            dir.clone()
                        } else {
                            let parent_slash = dir[..dir.len() - 1]
                                .iter()
                                .rposition(|&b| b == b'/')
                                .expect("non-root directories have a parent");
                            dir[parent_slash + 1..].to_vec()
                        };
                        let inode = InodeValue::Dir(DirInode {
                            user_id,
                            short_name,
                            children: vec![child_fp],
                        });
                        table.insert(key.as_slice(), inode.encode().as_slice())?;
                    }
                }
            }
            txn.commit()?;

            if dir == b"/" {
                break;
            }
            child_fp = dir_fp;
            let parent_slash = dir[..dir.len() - 1]
                .iter()
                .rposition(|&b| b == b'/')
                .expect("non-root directories have a parent");
            dir.truncate(parent_slash + 1);
        }

        Ok(())
    }
}

fn read_recipe_head(file: &mut fs::File, offset: u64) -> Result<RecipeHead, Error> {
    let mut head_bytes = [0u8; RECIPE_HEAD_SIZE];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut head_bytes)?;
    Ok(RecipeHead::decode(&head_bytes)?)
}

/// Canonicalize the received file identifier: reject empty and relative
/// forms, root it at `/`, and strip trailing slashes so a file name is
/// never its own ancestor directory. Identifiers are opaque bytes (name
/// shares), so a trailing `/` carries no meaning anyway.
pub(crate) fn canonical_name(raw: &[u8]) -> Result<Vec<u8>, Error> {
    if raw.is_empty() {
        return Err(Error::InvalidRequest("empty file name".into()));
    }
    if raw.starts_with(b"./") || raw.starts_with(b"../") {
        return Err(Error::InvalidRequest(
            "file names must not be relative".into(),
        ));
    }
    let mut name = Vec::with_capacity(raw.len() + 1);
    if raw[0] != b'/' {
        name.push(b'/');
    }
    name.extend_from_slice(raw);
    while name.len() > 1 && name.last() == Some(&b'/') {
        name.pop();
    }
    if name == b"/" {
        return Err(Error::InvalidRequest("file name has no final component".into()));
    }
    Ok(name)
}

/// Fingerprint identifying an inode: `SHA-256(name ‖ user_id)`.
pub(crate) fn inode_fp(name: &[u8], user_id: u32) -> Fingerprint {
    let mut input = Vec::with_capacity(name.len() + 4);
    input.extend_from_slice(name);
    input.extend_from_slice(&user_id.to_le_bytes());
    sha256_fingerprint(&input)
}

pub(crate) fn inode_key(fp: &Fingerprint) -> [u8; KEY_SIZE] {
    index_key(INODE_PREFIX, fp)
}

pub(crate) fn share_key(fp: &Fingerprint) -> [u8; KEY_SIZE] {
    index_key(SHARE_PREFIX, fp)
}

fn index_key(prefix: u8, fp: &Fingerprint) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    key[0] = prefix;
    key[1..].copy_from_slice(fp.as_slice());
    key
}

/// Shared lookup used by the restore path.
impl DedupEngine {
    pub(crate) fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEDUP_TABLE)?;
        Ok(table.get(key)?.map(|g| g.value().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_wire::metadata::{FileShareHeader, ShareMeta};

    fn engine(dir: &Path) -> DedupEngine {
        DedupEngine::open(dir).unwrap()
    }

    /// Build a one-file META payload over the given share bodies.
    fn meta_for(
        name: &[u8],
        file_size: i64,
        past: (i32, i64),
        bodies: &[Vec<u8>],
        first_id: i32,
        secret_size: i32,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let header = FileShareHeader {
            file_size,
            past_secrets: past.0,
            past_bytes: past.1,
            coming_secrets: bodies.len() as i32,
            coming_bytes: bodies.len() as i64 * secret_size as i64,
        };
        header.encode_with_name(name, &mut out);
        for (i, body) in bodies.iter().enumerate() {
            ShareMeta {
                fp: sha256_fingerprint(body),
                secret_id: first_id + i as i32,
                secret_size,
                share_size: body.len() as i32,
            }
            .encode(&mut out);
        }
        out
    }

    fn bodies(count: usize, len: usize, seed: u8) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                (0..len)
                    .map(|j| (seed as usize + i * 31 + j * 7) as u8)
                    .collect()
            })
            .collect()
    }

    fn upload(engine: &DedupEngine, user: u32, meta: &[u8], bodies: &[Vec<u8>]) -> Vec<bool> {
        let reply = engine.first_stage(user, meta).unwrap();
        let data: Vec<u8> = bodies
            .iter()
            .zip(&reply.duplicates)
            .filter(|(_, &dup)| !dup)
            .flat_map(|(b, _)| b.clone())
            .collect();
        engine
            .second_stage(user, meta, &reply.duplicates, &data)
            .unwrap();
        reply.duplicates
    }

    #[test]
    fn first_upload_has_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(4, 64, 1);
        let meta = meta_for(b"/f", 4 * 100, (0, 0), &shares, 0, 100);

        let reply = engine.first_stage(1, &meta).unwrap();
        assert_eq!(reply.duplicates, vec![false; 4]);
        assert_eq!(reply.data_bytes, 4 * 64);
    }

    #[test]
    fn second_upload_is_all_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(4, 64, 2);
        let meta = meta_for(b"/f", 400, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);

        let reply = engine.first_stage(1, &meta).unwrap();
        assert_eq!(reply.duplicates, vec![true; 4]);
        assert_eq!(reply.data_bytes, 0);
        // duplicates consume no data
        engine
            .second_stage(1, &meta, &reply.duplicates, &[])
            .unwrap();
    }

    #[test]
    fn cross_user_upload_sends_no_data_but_gains_a_ref() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(3, 48, 3);
        let meta = meta_for(b"/f", 300, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);

        // First stage for user 2 sees no intra-user duplicates...
        let reply = engine.first_stage(2, &meta).unwrap();
        assert_eq!(reply.duplicates, vec![false; 3]);
        // ...so the client sends the bodies, and stage two dedups them
        // against user 1's copies.
        let data: Vec<u8> = shares.concat();
        engine.second_stage(2, &meta, &reply.duplicates, &data).unwrap();

        let raw = engine
            .get_value(&share_key(&sha256_fingerprint(&shares[0])))
            .unwrap()
            .unwrap();
        let value = ShareValue::decode(&raw).unwrap();
        assert_eq!(value.refs.len(), 2);
        assert!(value.owned_by(1));
        assert!(value.owned_by(2));
    }

    #[test]
    fn corrupt_share_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(1, 32, 4);
        let meta = meta_for(b"/f", 100, (0, 0), &shares, 0, 100);

        let reply = engine.first_stage(1, &meta).unwrap();
        let mut data = shares[0].clone();
        data[0] ^= 1;
        assert!(matches!(
            engine.second_stage(1, &meta, &reply.duplicates, &data),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn file_inode_gains_versions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(2, 32, 5);
        let meta = meta_for(b"/dir/f", 200, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);
        upload(&engine, 1, &meta, &shares);

        let name = canonical_name(b"/dir/f").unwrap();
        let raw = engine
            .get_value(&inode_key(&inode_fp(&name, 1)))
            .unwrap()
            .unwrap();
        match InodeValue::decode(&raw).unwrap() {
            InodeValue::File(file) => {
                assert_eq!(file.versions.len(), 2);
                assert_eq!(file.short_name, b"f");
            }
            other => panic!("expected a file inode, got {:?}", other),
        }

        // ancestor directories exist and chain up to the root
        let dir_raw = engine
            .get_value(&inode_key(&inode_fp(b"/dir/", 1)))
            .unwrap()
            .unwrap();
        match InodeValue::decode(&dir_raw).unwrap() {
            InodeValue::Dir(d) => assert_eq!(d.children, vec![inode_fp(&name, 1)]),
            other => panic!("expected a dir inode, got {:?}", other),
        }
        let root_raw = engine
            .get_value(&inode_key(&inode_fp(b"/", 1)))
            .unwrap()
            .unwrap();
        match InodeValue::decode(&root_raw).unwrap() {
            InodeValue::Dir(d) => assert_eq!(d.children, vec![inode_fp(b"/dir/", 1)]),
            other => panic!("expected a dir inode, got {:?}", other),
        }
    }

    #[test]
    fn idle_buffer_flushes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let engine = DedupEngine::open_with(
            dir.path(),
            Duration::from_millis(10),
            None,
            None,
        )
        .unwrap();
        let shares = bodies(2, 32, 6);
        let meta = meta_for(b"/f", 200, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);

        std::thread::sleep(Duration::from_millis(20));
        engine.flush_idle();

        // the single sealed recipe file and container exist on disk
        let recipes: Vec<_> = fs::read_dir(dir.path().join("RecipeFiles"))
            .unwrap()
            .collect();
        assert_eq!(recipes.len(), 1);
        let containers: Vec<_> = fs::read_dir(dir.path().join("ShareContainers"))
            .unwrap()
            .collect();
        assert_eq!(containers.len(), 1);
    }

    #[test]
    fn flush_all_persists_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(3, 40, 7);
        let meta = meta_for(b"/f", 300, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);
        engine.flush_all().unwrap();

        let containers: Vec<_> = fs::read_dir(dir.path().join("ShareContainers"))
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(containers.len(), 1);
        assert_eq!(
            containers[0].metadata().unwrap().len(),
            3 * 40,
            "container holds exactly the unique share bytes"
        );
    }

    #[test]
    fn canonical_name_handling() {
        assert_eq!(canonical_name(b"/a/b").unwrap(), b"/a/b");
        assert_eq!(canonical_name(b"a").unwrap(), b"/a");
        assert_eq!(canonical_name(b"/a/b//").unwrap(), b"/a/b");
        assert!(canonical_name(b"").is_err());
        assert!(canonical_name(b"/").is_err());
        assert!(canonical_name(b"./x").is_err());
        assert!(canonical_name(b"../x").is_err());
    }

    #[test]
    fn names_with_trailing_slash_bytes_still_index() {
        // Opaque identifiers can end in a slash byte; the file must not
        // collide with its own parent directory.
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let shares = bodies(1, 32, 9);
        let meta = meta_for(b"/dir/x/", 100, (0, 0), &shares, 0, 100);
        upload(&engine, 1, &meta, &shares);

        let raw = engine
            .get_value(&inode_key(&inode_fp(b"/dir/x", 1)))
            .unwrap()
            .unwrap();
        assert!(matches!(
            InodeValue::decode(&raw).unwrap(),
            InodeValue::File(_)
        ));
    }
}
