//! Optional cold tier: a local directory acting as a write-back cache over
//! an external object store.
//!
//! Sealed archives are enqueued for asynchronous upload by a background
//! storer task; restores open archives locally when present and otherwise
//! fetch them back from the backend, charging their size against the cache
//! budget. A cache-updater task tracks recency in an LRU and deletes the
//! least recently used local copies while the budget is exceeded. Files
//! still pending upload are not tracked by the LRU and therefore never
//! evicted.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::Error;

struct UsedRecord {
    name: String,
    size: u64,
}

/// Handle to one cold-tier cache (one per archive directory).
pub struct ColdTier {
    cache_dir: PathBuf,
    backend: Arc<dyn ObjectStore>,
    base: ObjectPath,
    store_tx: mpsc::UnboundedSender<String>,
    used_tx: mpsc::UnboundedSender<UsedRecord>,
}

impl ColdTier {
    /// Start a cold tier over `backend`, caching at most `avail_cache_size`
    /// bytes of restored archives under `cache_dir` (which is the archive
    /// directory itself). Spawns the storer and cache-updater tasks; both
    /// stop when the returned handle is dropped.
    pub fn new(
        cache_dir: PathBuf,
        avail_cache_size: u64,
        backend: Arc<dyn ObjectStore>,
        base: ObjectPath,
    ) -> Arc<Self> {
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (used_tx, used_rx) = mpsc::unbounded_channel();

        let tier = Arc::new(ColdTier {
            cache_dir,
            backend,
            base,
            store_tx,
            used_tx,
        });

        tokio::spawn(storer_task(tier.clone(), store_rx));
        tokio::spawn(cache_updater_task(
            tier.cache_dir.clone(),
            avail_cache_size,
            used_rx,
        ));
        tier
    }

    /// Enqueue a freshly sealed archive for upload to the backend. The
    /// local copy stays until space pressure evicts it.
    pub fn add_new_file(&self, short_name: &str) {
        if self.store_tx.send(short_name.to_string()).is_err() {
            warn!(name = short_name, "cold-tier storer is gone; file stays local");
        }
    }

    /// Open an archive, restoring it from the backend when the local copy
    /// was evicted. Blocking; call from blocking context only.
    pub fn open_old_file(&self, short_name: &str) -> Result<fs::File, Error> {
        let path = self.cache_dir.join(short_name);

        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                // Evicted: fetch it back and re-account its size.
                let location = self.base.child(short_name);
                let backend = self.backend.clone();
                let bytes = tokio::runtime::Handle::current()
                    .block_on(async move { backend.get(&location).await?.bytes().await })
                    .map_err(|e| Error::StorageError(e.to_string()))?;
                fs::write(&path, &bytes)?;
                debug!(name = short_name, bytes = bytes.len(), "restored archive from backend");
                bytes.len() as u64
            }
        };

        let _ = self.used_tx.send(UsedRecord {
            name: short_name.to_string(),
            size,
        });
        Ok(fs::File::open(&path)?)
    }
}

/// Drains the pending-upload queue; each stored file becomes a
/// recently-used cache entry, making its local copy evictable.
async fn storer_task(tier: Arc<ColdTier>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(name) = rx.recv().await {
        let path = tier.cache_dir.join(&name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(name, err = %e, "cannot read archive pending upload");
                continue;
            }
        };
        let size = bytes.len() as u64;
        let location = tier.base.child(name.as_str());
        match tier.backend.put(&location, PutPayload::from(bytes)).await {
            Ok(_) => {
                debug!(name, size, "stored archive in backend");
                let _ = tier.used_tx.send(UsedRecord { name, size });
            }
            Err(e) => warn!(name, err = %e, "failed to store archive in backend"),
        }
    }
}

/// Applies recently-used records to the LRU and evicts local copies while
/// the used size exceeds the budget.
async fn cache_updater_task(
    cache_dir: PathBuf,
    avail: u64,
    mut rx: mpsc::UnboundedReceiver<UsedRecord>,
) {
    // The LRU is bounded by the byte budget, not an entry count.
    let mut lru: LruCache<String, u64> = LruCache::unbounded();
    let mut used: u64 = 0;

    while let Some(record) = rx.recv().await {
        match lru.get(&record.name) {
            Some(_) => {
                // get() already promoted it to most recently used.
            }
            None => {
                lru.put(record.name.clone(), record.size);
                used += record.size;
            }
        }

        while used > avail {
            let Some((victim, size)) = lru.pop_lru() else {
                break;
            };
            match tokio::fs::remove_file(cache_dir.join(&victim)).await {
                Ok(()) => debug!(name = victim, size, "evicted archive from cache"),
                Err(e) => warn!(name = victim, err = %e, "failed to evict archive"),
            }
            used = used.saturating_sub(size);
        }
    }
}
