//! Per-user write-combining buffers.
//!
//! Each active user owns at most one [UserBuffer], holding the recipe
//! records and share bodies accumulated since the last seal. The handling
//! connection checks the buffer out of the [BufferPool] for the duration of
//! an ingest, so no lock is held while the engine works on it; checkout also
//! surfaces any other user's buffer that has been idle for too long, for the
//! caller to flush and drop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cirrus_dispersal::Fingerprint;

use crate::names::ArchiveName;

/// Capacity of a recipe buffer before it is sealed to disk.
pub const RECIPE_BUFFER_SIZE: usize = 4 << 20;
/// Capacity of a container buffer before it is sealed to disk.
pub const CONTAINER_BUFFER_SIZE: usize = 4 << 20;
/// Idle time after which a buffer is flushed and evicted.
pub const MAX_BUFFER_WAIT: Duration = Duration::from_secs(1800);

/// The transient server-side state of one user's in-flight uploads.
pub struct UserBuffer {
    pub user_id: u32,

    /// Name the recipe buffer will seal to.
    pub recipe_name: ArchiveName,
    pub recipe_buf: Vec<u8>,
    /// Offset of the most recent recipe head within `recipe_buf`.
    pub last_recipe_head_pos: usize,
    /// Inode fingerprint of the most recent file, for locating its previous
    /// recipe file when appending across rounds.
    pub last_inode_fp: Option<Fingerprint>,

    /// Name the container buffer will seal to.
    pub container_name: ArchiveName,
    pub container_buf: Vec<u8>,

    pub last_use: Instant,
}

impl UserBuffer {
    pub fn new(user_id: u32, recipe_name: ArchiveName, container_name: ArchiveName) -> Self {
        UserBuffer {
            user_id,
            recipe_name,
            recipe_buf: Vec::with_capacity(RECIPE_BUFFER_SIZE),
            last_recipe_head_pos: 0,
            last_inode_fp: None,
            container_name,
            container_buf: Vec::with_capacity(CONTAINER_BUFFER_SIZE),
            last_use: Instant::now(),
        }
    }
}

/// All live user buffers, keyed by user ID.
pub struct BufferPool {
    inner: Mutex<HashMap<u32, UserBuffer>>,
    max_idle: Duration,
}

impl BufferPool {
    pub fn new(max_idle: Duration) -> Self {
        BufferPool {
            inner: Mutex::new(HashMap::new()),
            max_idle,
        }
    }

    /// Take the buffer of `user_id` out of the pool, creating one with
    /// `mk_new` if absent. Also removes every other user's buffer that has
    /// been idle beyond the limit; the caller must flush those.
    pub fn checkout<E>(
        &self,
        user_id: u32,
        mk_new: impl FnOnce() -> Result<UserBuffer, E>,
    ) -> Result<(UserBuffer, Vec<UserBuffer>), E> {
        let mut inner = self.inner.lock();

        let now = Instant::now();
        let stale: Vec<u32> = inner
            .values()
            .filter(|b| b.user_id != user_id && now.duration_since(b.last_use) > self.max_idle)
            .map(|b| b.user_id)
            .collect();
        let evicted: Vec<UserBuffer> = stale
            .into_iter()
            .filter_map(|uid| inner.remove(&uid))
            .collect();

        let mut buffer = match inner.remove(&user_id) {
            Some(b) => b,
            None => mk_new()?,
        };
        buffer.last_use = now;
        Ok((buffer, evicted))
    }

    /// Return a checked-out buffer.
    pub fn checkin(&self, mut buffer: UserBuffer) {
        buffer.last_use = Instant::now();
        self.inner.lock().insert(buffer.user_id, buffer);
    }

    /// Remove and return every buffer; used on shutdown.
    pub fn take_all(&self) -> Vec<UserBuffer> {
        self.inner.lock().drain().map(|(_, b)| b).collect()
    }

    /// Remove and return every buffer idle beyond the limit.
    pub fn take_idle(&self) -> Vec<UserBuffer> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<u32> = inner
            .values()
            .filter(|b| now.duration_since(b.last_use) > self.max_idle)
            .map(|b| b.user_id)
            .collect();
        stale.into_iter().filter_map(|uid| inner.remove(&uid)).collect()
    }

    /// Read the live recipe buffer of `user_id` if its current recipe name
    /// matches; serves restores of not-yet-sealed recipes.
    pub fn snapshot_recipe(&self, user_id: u32, name: &ArchiveName) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .get(&user_id)
            .filter(|b| b.recipe_name == *name)
            .map(|b| b.recipe_buf.clone())
    }

    /// Read any user's live container buffer holding `name`; serves restores
    /// of not-yet-sealed containers.
    pub fn snapshot_container(&self, name: &ArchiveName) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .values()
            .find(|b| b.container_name == *name)
            .map(|b| b.container_buf.clone())
    }
}
