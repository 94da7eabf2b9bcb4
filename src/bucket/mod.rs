//! # Bucket Engine
//!
//! A bucket is one shard of the store: a directory holding a data log, its
//! hint segments, a hash-tree snapshot, the collision table and the GC
//! history. The bucket owns all of them and implements the versioned
//! read/write path on top.
//!
//! ## Read path
//!
//! ```text
//! get(key) ─► collision table (exact key) ──hit──► data log
//!                  │ miss
//!                  ▼
//!             hash tree (hash) ──► data log ──key matches──► done
//!                                        │ other key
//!                                        ▼
//!                           hints (exact key) ─► register both keys
//!                                                in the collision table
//! ```
//!
//! ## Write path
//!
//! Every mutation holds the bucket's write lock. [`Bucket::set`] demands a
//! [`WriteGuard`] to prove it: the record is appended, then the hash tree,
//! the hint buffers and (for registered keys) the collision table follow.

#[cfg(test)]
mod tests;

mod recovery;

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread::JoinHandle,
};

use crossbeam::sync::{ShardedLock, ShardedLockReadGuard};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::collision::{CollisionEntry, CollisionError, CollisionTable};
use crate::datalog::{DataLog, DataLogError, record_size};
use crate::gc::{self, GcContext, GcEngine, GcError, GcRun};
use crate::hint::{HintConfig, HintError, HintManager};
use crate::htree::{self, HashTree, HashTreeError};
use crate::key::{self, KeyDescriptor, KeyHasher};
use crate::position::{HintSegmentId, Position};
use crate::record::{Payload, Record, RecordFlag, now_secs};

/// Longest decimal text accepted as a counter value.
const MAX_COUNTER_LEN: usize = 22;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("Data log error: {0}")]
    DataLog(#[from] DataLogError),

    #[error("Hint error: {0}")]
    Hint(#[from] HintError),

    #[error("Hash tree error: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("Collision table error: {0}")]
    Collision(#[from] CollisionError),

    #[error("GC error: {0}")]
    Gc(#[from] GcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller asked for something the bucket will not do.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub bucket_id: u32,
    /// Size at which a data chunk is sealed.
    pub data_file_max: u32,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub hint: HintConfig,
    pub key_hasher: KeyHasher,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket_id: 0,
            data_file_max: 4000 * 1024 * 1024,
            max_key_len: 250,
            max_value_len: 50 * 1024 * 1024,
            hint: HintConfig::default(),
            key_hasher: key::fnv1a_64,
        }
    }
}

/// Proof that the caller holds the bucket's write lock.
pub type WriteGuard<'a> = MutexGuard<'a, ()>;

// ------------------------------------------------------------------------------------------------
// Version reconciliation
// ------------------------------------------------------------------------------------------------

/// Decides the version a write gets, given the stored one (`0` when the key
/// is absent). `requested == 0` asks for the next version, a negative value
/// asks for a deletion, and a positive value is taken as-is when it is newer.
/// `None` means the write is stale and must be dropped.
pub fn reconcile_version(old: i32, requested: i32) -> Option<i32> {
    match requested {
        0 if old > 0 => Some(old + 1),
        0 => Some(-old + 1),
        r if r < 0 => Some(-old.abs() - 1),
        r if r.unsigned_abs() > old.unsigned_abs() => Some(r),
        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Bucket
// ------------------------------------------------------------------------------------------------

pub struct Bucket {
    id: u32,
    home: PathBuf,
    config: BucketConfig,

    write_lock: Mutex<()>,

    /// Held shared while a position is resolved and read, exclusively by
    /// GC while it swaps chunk contents and repoints the indexes.
    layout: ShardedLock<()>,

    pub(crate) datalog: Arc<DataLog>,
    pub(crate) hints: Arc<HintManager>,
    pub(crate) htree: HashTree,
    pub(crate) collisions: Arc<CollisionTable>,

    /// Newest hint segment folded into the hash tree.
    tree_id: Mutex<HintSegmentId>,

    gc: GcEngine,

    /// Background hint-coverage check over chunks older than the snapshot.
    healer: Mutex<Option<JoinHandle<()>>>,
}

impl Bucket {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn tree_id(&self) -> Result<HintSegmentId, BucketError> {
        Ok(*self
            .tree_id
            .lock()
            .map_err(|_| BucketError::Internal("Mutex poisoned".into()))?)
    }

    /// Takes the write lock. Hold it across [`Bucket::set`] calls.
    pub fn lock_writes(&self) -> Result<WriteGuard<'_>, BucketError> {
        self.write_lock
            .lock()
            .map_err(|_| BucketError::Internal("Mutex poisoned".into()))
    }

    fn describe(&self, key: &[u8]) -> Result<KeyDescriptor, BucketError> {
        if key.is_empty() {
            return Err(BucketError::InvalidArgument("empty key".into()));
        }
        if key.len() > self.config.max_key_len {
            return Err(BucketError::InvalidArgument(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                self.config.max_key_len
            )));
        }
        Ok(KeyDescriptor::new(key, self.config.key_hasher))
    }

    fn describe_writable(&self, key: &[u8]) -> Result<KeyDescriptor, BucketError> {
        let ki = self.describe(key)?;
        if ki.is_path {
            return Err(BucketError::InvalidArgument(format!(
                "{:?} is a directory path",
                ki.string_key
            )));
        }
        Ok(ki)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Current payload of `key`; tombstones come back with `version <= 0`.
    ///
    /// With `meta_only` the value is left empty. A key starting with `@`
    /// returns the [`Bucket::list_dir`] listing of the rest of the key as
    /// its value, one line per entry.
    pub fn get(&self, key: &[u8], meta_only: bool) -> Result<Option<Payload>, BucketError> {
        let ki = self.describe(key)?;
        if let Some(prefix) = ki.path_prefix() {
            let lines = self.htree.list_dir(prefix)?;
            return Ok(Some(Payload::new(
                0,
                RecordFlag::Plain,
                now_secs(),
                lines.join("\n").into_bytes(),
            )));
        }
        self.lookup(&ki, meta_only, None)
    }

    fn lookup(
        &self,
        ki: &KeyDescriptor,
        meta_only: bool,
        held: Option<&WriteGuard<'_>>,
    ) -> Result<Option<Payload>, BucketError> {
        {
            let _layout = self.read_layout()?;
            if let Some(payload) = self.lookup_registered(ki, meta_only)? {
                return Ok(Some(payload));
            }
            let Some((meta, pos)) = self.htree.get(ki)? else {
                return Ok(None);
            };
            // Read even for meta_only: only the stored key tells this key
            // apart from another one sharing its hash.
            let record = self.datalog.read_at(pos)?;
            if record.key == ki.raw_key {
                return Ok(Some(if meta_only {
                    Payload::meta_only(meta)
                } else {
                    record.payload
                }));
            }
        }

        // The hash belongs to another key; settle it under the write lock so
        // no write slips between the hint lookup and the registration. The
        // layout lock is always taken after the write lock.
        match held {
            Some(guard) => self.resolve_collision(guard, ki, meta_only),
            None => {
                let guard = self.lock_writes()?;
                self.resolve_collision(&guard, ki, meta_only)
            }
        }
    }

    fn read_layout(&self) -> Result<ShardedLockReadGuard<'_, ()>, BucketError> {
        self.layout
            .read()
            .map_err(|_| BucketError::Internal("ShardedLock poisoned".into()))
    }

    fn lookup_registered(
        &self,
        ki: &KeyDescriptor,
        meta_only: bool,
    ) -> Result<Option<Payload>, BucketError> {
        let Some(entry) = self.collisions.get(ki.hash, &ki.string_key)? else {
            return Ok(None);
        };
        if meta_only {
            return Ok(Some(Payload::meta_only(entry.meta)));
        }
        let record = self.datalog.read_at(entry.pos)?;
        if record.key != ki.raw_key {
            error!(key = %ki.string_key, pos = %entry.pos, "collision entry points at another key");
            return Ok(None);
        }
        Ok(Some(record.payload))
    }

    fn resolve_collision(
        &self,
        _guard: &WriteGuard<'_>,
        ki: &KeyDescriptor,
        meta_only: bool,
    ) -> Result<Option<Payload>, BucketError> {
        let _layout = self.read_layout()?;
        if let Some(payload) = self.lookup_registered(ki, meta_only)? {
            return Ok(Some(payload));
        }
        let Some((tree_meta, tree_pos)) = self.htree.get(ki)? else {
            return Ok(None);
        };
        let owner = self.datalog.read_at(tree_pos)?;
        if owner.key == ki.raw_key {
            return Ok(Some(if meta_only {
                Payload::meta_only(tree_meta)
            } else {
                owner.payload
            }));
        }

        let owner_key = key::key_string(&owner.key);
        if self.collisions.get(ki.hash, &owner_key)?.is_none() {
            self.collisions.set(CollisionEntry {
                key_hash: ki.hash,
                key: owner_key.clone(),
                meta: tree_meta,
                pos: tree_pos,
            })?;
        }

        let Some(found) = self.hints.get_item(ki.hash, &ki.string_key)? else {
            debug!(key = %ki.string_key, owner = %owner_key, "hash taken by another key, key absent");
            return Ok(None);
        };
        let record = self.datalog.read_at(found.pos)?;
        if record.key != ki.raw_key {
            error!(key = %ki.string_key, pos = %found.pos, "hint points at another key");
            return Ok(None);
        }
        self.collisions.set(CollisionEntry {
            key_hash: ki.hash,
            key: ki.string_key.clone(),
            meta: record.payload.meta,
            pos: found.pos,
        })?;
        info!(
            hash = format_args!("{:016x}", ki.hash),
            key = %ki.string_key,
            other = %owner_key,
            "hash collision registered"
        );

        Ok(Some(if meta_only {
            Payload::meta_only(record.payload.meta)
        } else {
            record.payload
        }))
    }

    /// Hash-space listing under a hex prefix; a leading `@` is ignored.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, BucketError> {
        let prefix = path.strip_prefix('@').unwrap_or(path);
        Ok(self.htree.list_dir(prefix)?)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Writes `payload` for `key` as-is, with no version checks.
    pub fn set(
        &self,
        guard: &WriteGuard<'_>,
        key: &[u8],
        payload: Payload,
    ) -> Result<Position, BucketError> {
        let ki = self.describe_writable(key)?;
        self.check_value(&payload)?;
        self.write_record(guard, &ki, payload)
    }

    fn write_record(
        &self,
        _guard: &WriteGuard<'_>,
        ki: &KeyDescriptor,
        mut payload: Payload,
    ) -> Result<Position, BucketError> {
        payload.meta.value_hash = key::value_hash(&payload.value);
        let record = Record {
            key: ki.raw_key.clone(),
            payload,
        };
        let pos = self.datalog.append(&record)?;
        let meta = record.payload.meta;

        self.htree.set(ki, meta, pos)?;
        self.hints.set(ki, meta, pos, record_size(&record))?;
        self.collisions.refresh(CollisionEntry {
            key_hash: ki.hash,
            key: ki.string_key.clone(),
            meta,
            pos,
        })?;
        trace!(key = %ki.string_key, version = meta.version, %pos, "record written");
        Ok(pos)
    }

    fn check_value(&self, payload: &Payload) -> Result<(), BucketError> {
        if payload.value.len() > self.config.max_value_len {
            return Err(BucketError::InvalidArgument(format!(
                "value of {} bytes exceeds {}",
                payload.value.len(),
                self.config.max_value_len
            )));
        }
        Ok(())
    }

    /// Versioned write. Stale versions and re-sent identical content are
    /// dropped silently.
    pub fn getset(&self, key: &[u8], payload: Payload) -> Result<(), BucketError> {
        let ki = self.describe_writable(key)?;
        self.check_value(&payload)?;

        let guard = self.lock_writes()?;
        let old = self.lookup(&ki, true, Some(&guard))?.map(|p| p.meta);
        let old_version = old.map_or(0, |m| m.version);

        let Some(version) = reconcile_version(old_version, payload.meta.version) else {
            debug!(
                key = %ki.string_key,
                stored = old_version,
                requested = payload.meta.version,
                "stale version, write dropped"
            );
            return Ok(());
        };

        let mut payload = payload;
        payload.meta.version = version;
        payload.meta.value_hash = key::value_hash(&payload.value);

        if let Some(old) = old {
            let same_content = old.value_hash == payload.meta.value_hash;
            let same_liveness = old.is_live() == payload.meta.is_live();
            if old.version.unsigned_abs() > 1 && same_content && same_liveness {
                debug!(key = %ki.string_key, version = old.version, "duplicate content, write skipped");
                return Ok(());
            }
        }

        self.write_record(&guard, &ki, payload)?;
        Ok(())
    }

    /// Tombstones `key` with the next negative version.
    pub fn delete(&self, key: &[u8]) -> Result<(), BucketError> {
        self.getset(key, Payload::new(-1, RecordFlag::Plain, now_secs(), Vec::new()))
    }

    /// Adds `delta` to the decimal counter stored under `key` and returns
    /// the new value. Absent and deleted keys count from zero.
    pub fn incr(&self, key: &[u8], delta: i64) -> Result<i64, BucketError> {
        let ki = self.describe_writable(key)?;

        let guard = self.lock_writes()?;
        let current = self.lookup(&ki, false, Some(&guard))?;
        let base = match &current {
            Some(p) if p.meta.is_live() => parse_counter(&ki, p)?,
            _ => 0,
        };
        let value = base.checked_add(delta).ok_or_else(|| {
            BucketError::InvalidArgument(format!("counter overflow: {base} + {delta}"))
        })?;

        let old_version = current.map_or(0, |p| p.meta.version);
        let version = reconcile_version(old_version, 0)
            .ok_or_else(|| BucketError::Internal("next version rejected".into()))?;
        self.write_record(
            &guard,
            &ki,
            Payload::new(version, RecordFlag::Incr, now_secs(), value.to_string().into_bytes()),
        )?;
        Ok(value)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Compacts data chunks `begin..=end` on the calling thread.
    pub fn gc(&self, begin: u32, end: u32) -> Result<GcRun, BucketError> {
        self.join_healer()?;
        let ctx = GcContext {
            home: &self.home,
            layout: &self.layout,
            datalog: &self.datalog,
            hints: &self.hints,
            htree: &self.htree,
            collisions: &self.collisions,
            key_hasher: self.config.key_hasher,
            data_file_max: self.config.data_file_max,
            dump_delay: self.config.hint.dump_delay,
        };
        let run = self.gc.run(&ctx, begin, end)?;
        self.set_tree_id(self.hints.max_dumped_id()?)?;
        Ok(run)
    }

    pub fn is_gc_running(&self) -> bool {
        self.gc.is_running()
    }

    pub fn gc_history(&self) -> Vec<GcRun> {
        self.gc.history()
    }

    /// Byte size of every data chunk, ascending by chunk id.
    pub fn chunk_sizes(&self) -> Result<Vec<(u32, u32)>, BucketError> {
        Ok(self.datalog.chunk_sizes()?.into_iter().collect())
    }

    /// Keys whose latest version is live, counted by hash.
    pub fn live_count(&self) -> Result<usize, BucketError> {
        Ok(self.htree.live_count()?)
    }

    /// Persists every index and stops background work.
    pub fn close(&self) -> Result<(), BucketError> {
        self.join_healer()?;
        self.datalog.flush()?;
        self.gc.persist()?;
        self.collisions.dump()?;
        self.hints.close()?;

        gc::remove_tree_snapshots(&self.home)?;
        let id = self.hints.max_dumped_id()?;
        if id != HintSegmentId::ZERO {
            self.htree
                .dump(&self.home.join(htree::snapshot_file_name(id)))?;
            self.set_tree_id(id)?;
        }
        info!(bucket = self.id, tree_id = %id, "bucket closed");
        Ok(())
    }

    fn set_tree_id(&self, id: HintSegmentId) -> Result<(), BucketError> {
        *self
            .tree_id
            .lock()
            .map_err(|_| BucketError::Internal("Mutex poisoned".into()))? = id;
        Ok(())
    }

    fn join_healer(&self) -> Result<(), BucketError> {
        let handle = self
            .healer
            .lock()
            .map_err(|_| BucketError::Internal("Mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            debug!(bucket = self.id, "waiting for hint coverage check");
            if handle.join().is_err() {
                error!(bucket = self.id, "hint coverage check panicked");
            }
        }
        Ok(())
    }
}

fn parse_counter(ki: &KeyDescriptor, payload: &Payload) -> Result<i64, BucketError> {
    if payload.flag != RecordFlag::Incr {
        return Err(BucketError::InvalidArgument(format!(
            "{:?} does not hold a counter",
            ki.string_key
        )));
    }
    if payload.value.len() > MAX_COUNTER_LEN {
        return Err(BucketError::InvalidArgument(format!(
            "counter of {:?} is {} bytes long",
            ki.string_key,
            payload.value.len()
        )));
    }
    std::str::from_utf8(&payload.value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            BucketError::InvalidArgument(format!("counter of {:?} is not a number", ki.string_key))
        })
}
