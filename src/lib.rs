//! # hstore
//!
//! An embeddable, persistent key-value storage engine for one shard
//! ("bucket") of a larger store. Records go to an append-only data log,
//! an in-memory hash tree indexes them by key hash, and compact hint
//! segments make restarts cheap. Online compaction reclaims the space of
//! overwritten and deleted keys while reads and writes keep flowing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hstore::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/my_bucket", StoreConfig::default()).unwrap();
//!
//! // Write, then overwrite: versions count up.
//! store.set(b"hello", b"world").unwrap();
//! store.set(b"hello", b"again").unwrap();
//!
//! let payload = store.get(b"hello").unwrap().unwrap();
//! assert_eq!(payload.value, b"again");
//! assert_eq!(payload.meta.version, 2);
//!
//! // Delete leaves a tombstone with a negative version.
//! store.delete(b"hello").unwrap();
//! assert_eq!(store.get_meta(b"hello").unwrap().unwrap().version, -3);
//!
//! // Counters
//! assert_eq!(store.incr(b"hits", 5).unwrap(), 5);
//!
//! // Compact every sealed chunk.
//! store.gc(0, u32::MAX).unwrap();
//!
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Versioned writes**: stale versions and re-sent content are dropped.
//! - **Hash-collision safety**: keys sharing a hash are told apart through
//!   a persisted collision table.
//! - **Fast restarts**: the hash tree is restored from a snapshot plus the
//!   hint segments written after it; damaged files are rebuilt from data.
//! - **Online GC**: chunks are rewritten in place or merged downwards while
//!   writers race it, with an audit history of every run.
//! - **CRC32 integrity**: records, segments and snapshots are checksummed.

pub(crate) mod bucket;
pub(crate) mod collision;
pub(crate) mod datalog;
pub(crate) mod encoding;
pub(crate) mod gc;
pub(crate) mod hint;
pub(crate) mod htree;
pub(crate) mod key;
pub(crate) mod position;
pub(crate) mod record;
pub(crate) mod snapshot;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

pub use bucket::{BucketError, reconcile_version};
pub use gc::{GcError, GcFileStats, GcRun};
pub use key::{KeyHasher, fnv1a_64};
pub use record::{Payload, RecordFlag, VersionedMeta};

use bucket::{Bucket, BucketConfig};
use hint::HintConfig;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
///
/// All fields have defaults via [`StoreConfig::default()`]. The
/// configuration is validated when passed to [`Store::open`].
///
/// # Example
///
/// ```rust
/// use hstore::StoreConfig;
///
/// let config = StoreConfig {
///     data_file_max: 64 * 1024 * 1024,
///     thread_pool_size: 2,
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Identifier carried in log lines.
    pub bucket_id: u32,

    /// Size in bytes at which a data chunk is sealed and a new one begun.
    ///
    /// Default: 4000 MiB. Must be ≥ 1024.
    pub data_file_max: u32,

    /// Longest accepted key in bytes.
    ///
    /// Default: 250. Must be ≥ 1.
    pub max_key_len: usize,

    /// Longest accepted value in bytes.
    ///
    /// Default: 50 MiB. Must leave room for a key inside one chunk.
    pub max_value_len: usize,

    /// Keys collected in a hint buffer before it is rotated out.
    ///
    /// Default: 65536. Must be ≥ 1.
    pub hint_buffer_max_items: usize,

    /// Minimum age of a rotated hint buffer before it is written to disk.
    pub hint_dump_delay: Duration,

    /// Tick of the hint worker.
    ///
    /// Must be non-zero.
    pub hint_dump_interval: Duration,

    /// Minimum time between background hint merges.
    pub hint_merge_interval: Duration,

    /// Number of background worker threads for scheduled GC.
    ///
    /// Default: 1. Must be ≥ 1.
    pub thread_pool_size: usize,

    /// Hash function from key bytes to the 64-bit key hash.
    pub key_hasher: KeyHasher,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let bucket = BucketConfig::default();
        Self {
            bucket_id: bucket.bucket_id,
            data_file_max: bucket.data_file_max,
            max_key_len: bucket.max_key_len,
            max_value_len: bucket.max_value_len,
            hint_buffer_max_items: bucket.hint.buffer_max_items,
            hint_dump_delay: bucket.hint.dump_delay,
            hint_dump_interval: bucket.hint.dump_interval,
            hint_merge_interval: bucket.hint.merge_interval,
            thread_pool_size: 1,
            key_hasher: bucket.key_hasher,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        if self.data_file_max < 1024 {
            return Err(StoreError::InvalidConfig(
                "data_file_max must be >= 1024".into(),
            ));
        }
        if self.max_key_len < 1 {
            return Err(StoreError::InvalidConfig("max_key_len must be >= 1".into()));
        }
        let largest = self.max_key_len as u64 + self.max_value_len as u64;
        if largest >= u64::from(self.data_file_max) {
            return Err(StoreError::InvalidConfig(
                "max_key_len + max_value_len must be < data_file_max".into(),
            ));
        }
        if self.hint_buffer_max_items < 1 {
            return Err(StoreError::InvalidConfig(
                "hint_buffer_max_items must be >= 1".into(),
            ));
        }
        if self.hint_dump_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "hint_dump_interval must be non-zero".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(StoreError::InvalidConfig(
                "thread_pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    fn to_bucket_config(&self) -> BucketConfig {
        BucketConfig {
            bucket_id: self.bucket_id,
            data_file_max: self.data_file_max,
            max_key_len: self.max_key_len,
            max_value_len: self.max_value_len,
            hint: HintConfig {
                buffer_max_items: self.hint_buffer_max_items,
                dump_delay: self.hint_dump_delay,
                dump_interval: self.hint_dump_interval,
                merge_interval: self.hint_merge_interval,
            },
            key_hasher: self.key_hasher,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A background worker could not be started.
    #[error("failed to start background worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0}")]
    Bucket(#[from] BucketError),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Holds the thread pool sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// # Thread safety
///
/// `Store` is `Send + Sync` and can be shared across threads via
/// `Arc<Store>`. Writes to one bucket are serialized; reads run in
/// parallel with writes and with GC.
///
/// # Background GC
///
/// [`Store::gc`] compacts on the calling thread. [`Store::schedule_gc`]
/// queues the same work on the background pool and returns at once; the
/// outcome lands in [`Store::gc_history`].
///
/// # Shutdown
///
/// Call [`Store::close`] for a graceful shutdown: queued GC runs finish,
/// hint buffers and the hash-tree snapshot are written. If the handle is
/// dropped without calling `close`, the destructor attempts the same, but
/// errors are only logged.
pub struct Store {
    bucket: Arc<Bucket>,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("bucket", &self.bucket.id())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the bucket stored in `path`.
    ///
    /// On an existing directory the hash tree is recovered from the newest
    /// snapshot and the hint segments written after it; chunks that no hint
    /// describes are scanned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if any configuration parameter
    /// is out of range.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let pool_size = config.thread_pool_size;
        let bucket = Arc::new(Bucket::open(&path, config.to_bucket_config())?);

        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("hstore-bg-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(StoreError::Spawn)?;
            workers.push(handle);
        }
        drop(receiver);

        info!(
            path = %path.as_ref().display(),
            bucket = bucket.id(),
            pool_size,
            "store opened"
        );

        Ok(Self {
            bucket,
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the store.
    ///
    /// Waits for queued GC runs, then persists the hint buffers, the
    /// collision table, the GC history and a hash-tree snapshot.
    ///
    /// Subsequent operations return [`StoreError::Closed`]. Calling `close`
    /// more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_pool()?;
        self.bucket.close()?;

        info!(bucket = self.bucket.id(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Current payload of `key`, tombstones included (`version <= 0`).
    ///
    /// A key starting with `@` lists the hash-tree directory named by the
    /// rest of the key instead; see [`Store::list_dir`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Payload>, StoreError> {
        self.check_open()?;
        Ok(self.bucket.get(key, false)?)
    }

    /// Version and value hash of `key`, without its value.
    pub fn get_meta(&self, key: &[u8]) -> Result<Option<VersionedMeta>, StoreError> {
        self.check_open()?;
        Ok(self.bucket.get(key, true)?.map(|p| p.meta))
    }

    /// Lists the hash-space directory under a hex prefix.
    ///
    /// Each line is `"{path}/ {count} {hash_sum}"` for a populated
    /// sub-directory. A full 16-digit path names a single hash and yields
    /// `"{hash} {version} {value_hash}"` when it is indexed.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        Ok(self.bucket.list_dir(path)?)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Stores `value` under the next version of `key`.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.getset(key, Payload::new(0, RecordFlag::Plain, record::now_secs(), value.to_vec()))
    }

    /// Versioned write. `payload.meta.version` is `0` for "next version",
    /// negative for a deletion, or an explicit positive version that only
    /// applies when it is newer than the stored one.
    pub fn getset(&self, key: &[u8], payload: Payload) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.bucket.getset(key, payload)?)
    }

    /// Tombstones `key`.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.bucket.delete(key)?)
    }

    /// Adds `delta` to the counter under `key` and returns the new value.
    pub fn incr(&self, key: &[u8], delta: i64) -> Result<i64, StoreError> {
        self.check_open()?;
        Ok(self.bucket.incr(key, delta)?)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Compacts data chunks `begin..=end` on the calling thread.
    ///
    /// The active chunk is never touched. Fails with
    /// [`GcError::AlreadyRunning`] while another run is in progress.
    pub fn gc(&self, begin: u32, end: u32) -> Result<GcRun, StoreError> {
        self.check_open()?;
        Ok(self.bucket.gc(begin, end)?)
    }

    /// Queues a GC run over `begin..=end` on the background pool.
    pub fn schedule_gc(&self, begin: u32, end: u32) -> Result<(), StoreError> {
        self.check_open()?;
        let guard = self
            .bg
            .lock()
            .map_err(|_| StoreError::Internal("Mutex poisoned".into()))?;
        let bg = guard.as_ref().ok_or(StoreError::Closed)?;

        let bucket = Arc::clone(&self.bucket);
        bg.sender
            .send(Box::new(move || match bucket.gc(begin, end) {
                Ok(run) => info!(
                    bucket = bucket.id(),
                    begin,
                    end,
                    released = run.bytes_released(),
                    "background GC finished"
                ),
                Err(e) => error!(bucket = bucket.id(), begin, end, "background GC failed: {e}"),
            }))
            .map_err(|_| StoreError::Closed)
    }

    /// Whether a GC run is in progress.
    pub fn is_gc_running(&self) -> bool {
        self.bucket.is_gc_running()
    }

    /// Every GC run this bucket remembers, oldest first.
    pub fn gc_history(&self) -> Vec<GcRun> {
        self.bucket.gc_history()
    }

    /// Byte size of every data chunk, ascending by chunk id.
    pub fn chunk_sizes(&self) -> Result<Vec<(u32, u32)>, StoreError> {
        self.check_open()?;
        Ok(self.bucket.chunk_sizes()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) -> Result<(), StoreError> {
        let pool = self
            .bg
            .lock()
            .map_err(|_| StoreError::Internal("Mutex poisoned".into()))?
            .take();
        if let Some(bg) = pool {
            drop(bg.sender);
            for worker in bg.workers {
                if worker.join().is_err() {
                    warn!("background worker panicked");
                }
            }
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.shutdown_pool() {
                error!("failed to stop background workers: {e}");
            }
            if let Err(e) = self.bucket.close() {
                error!(bucket = self.bucket.id(), "close on drop failed: {e}");
            }
        }
    }
}
