//! # Hint Subsystem
//!
//! Hints are compact index records `(hash, key, version, value hash,
//! offset)` derived from data records. They make recovery cheap: instead
//! of scanning every data chunk, the hash-tree is rebuilt from the hint
//! segments written after its last snapshot.
//!
//! ## Pipeline
//!
//! ```text
//! set() ──► active buffer ──rotate──► pending buffers ──dump──► {chunk}.{split}.s
//!                                                                    │
//!                                                                 merge
//!                                                                    ▼
//!                                                    one segment per chunk
//! ```
//!
//! - A background worker rotates aged buffers, dumps them and periodically
//!   merges each chunk's segments into one. Merging also discovers keys that
//!   share a hash and registers them in the collision table.
//! - Dumps happen strictly in rotation order, so the newest dumped segment
//!   id ([`HintManager::max_dumped_id`]) always bounds everything on disk.
//!
//! ## GC coordination
//!
//! GC and the background merge both rewrite segment files. They exclude each
//! other through a small state machine guarded by a `Mutex` + `Condvar`:
//! [`HintManager::begin_gc`] blocks until no merge is running, and
//! [`HintManager::try_begin_merge`] refuses to start while GC is active.

#[cfg(test)]
mod tests;

mod buffer;
pub mod segment;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::collision::{CollisionEntry, CollisionError, CollisionTable};
use crate::encoding::EncodingError;
use crate::key::KeyDescriptor;
use crate::position::{HintSegmentId, Position};
use crate::record::VersionedMeta;

use buffer::HintBuffer;
pub use segment::{HintItem, HintLookup, HintSegment, SegmentHeader};

/// Cached segments kept before the cache is flushed wholesale.
const SEGMENT_CACHE_CAPACITY: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HintError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Collision table error: {0}")]
    Collision(#[from] CollisionError),

    /// A segment file failed validation.
    #[error("corrupt hint segment {0}: {1}")]
    Corrupt(PathBuf, String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration and results
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HintConfig {
    /// Keys per buffer before it is rotated.
    pub buffer_max_items: usize,
    /// Minimum age of a rotated buffer before the worker dumps it.
    pub dump_delay: Duration,
    /// Worker tick; also the age at which the active buffer is rotated.
    pub dump_interval: Duration,
    /// Minimum time between background merges.
    pub merge_interval: Duration,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            buffer_max_items: 64 * 1024,
            dump_delay: Duration::from_millis(500),
            dump_interval: Duration::from_secs(1),
            merge_interval: Duration::from_secs(60),
        }
    }
}

/// Where a hint says a key's record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintEntry {
    pub meta: VersionedMeta,
    pub pos: Position,
}

/// Answer of [`HintManager::buffered_lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup {
    Found(HintEntry),
    /// Only other keys with the same hash are buffered.
    OtherKey,
    Absent,
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HintPhase {
    gc: bool,
    merging: bool,
}

struct HintState {
    active: Option<HintBuffer>,
    pending: VecDeque<HintBuffer>,
    next_seq: u64,
    /// Segment files on disk: chunk → splits.
    segments: BTreeMap<u32, BTreeSet<u32>>,
    cache: HashMap<HintSegmentId, Arc<HintSegment>>,
    max_dumped: HintSegmentId,
    /// When set, only buffers of chunks up to this one may be dumped.
    max_dumpable_chunk: Option<u32>,
}

impl HintState {
    fn next_split(&self, chunk: u32) -> u32 {
        self.segments
            .get(&chunk)
            .and_then(|splits| splits.last())
            .map_or(1, |s| s + 1)
    }

    fn register(&mut self, id: HintSegmentId) {
        self.segments
            .entry(id.chunk_id)
            .or_default()
            .insert(id.split_id);
        self.cache.remove(&id);
        if id > self.max_dumped {
            self.max_dumped = id;
        }
    }

    fn unregister(&mut self, id: HintSegmentId) {
        if let Some(splits) = self.segments.get_mut(&id.chunk_id) {
            splits.remove(&id.split_id);
            if splits.is_empty() {
                self.segments.remove(&id.chunk_id);
            }
        }
        self.cache.remove(&id);
    }

    fn rotate(&mut self) {
        if let Some(mut buf) = self.active.take() {
            if buf.is_empty() {
                return;
            }
            buf.rotated_at = Some(Instant::now());
            trace!(chunk = buf.chunk, items = buf.len(), "hint buffer rotated");
            self.pending.push_back(buf);
        }
    }

    /// Newest-first lookup over the active and pending buffers.
    fn lookup_buffers(&self, hash: u64, key: &str) -> KeyLookup {
        let mut other = false;
        for buf in self.active.iter().chain(self.pending.iter().rev()) {
            match buf.lookup(hash, key) {
                HintLookup::Found(item) => {
                    return KeyLookup::Found(HintEntry {
                        meta: item.meta,
                        pos: Position::new(buf.chunk, item.offset),
                    });
                }
                HintLookup::OtherKey => other = true,
                HintLookup::Absent => {}
            }
        }
        if other {
            KeyLookup::OtherKey
        } else {
            KeyLookup::Absent
        }
    }
}

struct Worker {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// HintManager
// ------------------------------------------------------------------------------------------------

pub struct HintManager {
    home: PathBuf,
    config: HintConfig,
    collisions: Arc<CollisionTable>,

    state: Mutex<HintState>,

    /// Serializes every operation that creates or deletes segment files.
    /// Acquired before `state`, never while holding it.
    io: Mutex<()>,

    phase: Mutex<HintPhase>,
    phase_cv: Condvar,

    worker: Mutex<Option<Worker>>,
}

impl HintManager {
    /// Enumerates the segments in `home` and starts the background worker.
    pub fn open(
        home: impl AsRef<Path>,
        config: HintConfig,
        collisions: Arc<CollisionTable>,
    ) -> Result<Arc<Self>, HintError> {
        let home = home.as_ref().to_path_buf();

        let mut segments: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        let mut max_dumped = HintSegmentId::ZERO;
        for entry in fs::read_dir(&home)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".s.tmp") {
                warn!(file = %name, "removing unfinished hint segment");
                fs::remove_file(entry.path())?;
                continue;
            }
            if let Some(id) = HintSegmentId::parse_file_name(&name, segment::SEGMENT_SUFFIX) {
                segments.entry(id.chunk_id).or_default().insert(id.split_id);
                max_dumped = max_dumped.max(id);
            }
        }
        let count: usize = segments.values().map(BTreeSet::len).sum();
        info!(segments = count, %max_dumped, "hint manager opened");

        let manager = Arc::new(Self {
            home,
            config,
            collisions,
            state: Mutex::new(HintState {
                active: None,
                pending: VecDeque::new(),
                next_seq: 0,
                segments,
                cache: HashMap::new(),
                max_dumped,
                max_dumpable_chunk: None,
            }),
            io: Mutex::new(()),
            phase: Mutex::new(HintPhase::default()),
            phase_cv: Condvar::new(),
            worker: Mutex::new(None),
        });
        manager.start_worker()?;
        Ok(manager)
    }

    fn start_worker(self: &Arc<Self>) -> Result<(), HintError> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.config.dump_interval);
        let weak: Weak<Self> = Arc::downgrade(self);
        let merge_interval = self.config.merge_interval;

        let handle = thread::Builder::new()
            .name("hstore-hint".into())
            .spawn(move || {
                let mut last_merge = Instant::now();
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let Some(manager) = weak.upgrade() else { break };
                            if let Err(e) = manager.background_tick(&mut last_merge, merge_interval) {
                                error!("hint worker tick failed: {e}");
                            }
                        }
                    }
                }
                debug!("hint worker stopped");
            })?;

        *self.lock_worker()? = Some(Worker {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    fn background_tick(
        &self,
        last_merge: &mut Instant,
        merge_interval: Duration,
    ) -> Result<(), HintError> {
        {
            let mut state = self.lock_state()?;
            let aged = state
                .active
                .as_ref()
                .is_some_and(|b| b.created_at.elapsed() >= self.config.dump_interval);
            if aged {
                state.rotate();
            }
        }
        self.dump(false)?;

        if last_merge.elapsed() >= merge_interval && self.try_begin_merge()? {
            let result = self.merge();
            self.end_merge()?;
            *last_merge = Instant::now();
            result?;
        }
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    // --------------------------------------------------------------------------------------------
    // Buffers
    // --------------------------------------------------------------------------------------------

    /// Records the hint for a record written at `pos` and `rec_size` bytes long.
    pub fn set(
        &self,
        ki: &KeyDescriptor,
        meta: VersionedMeta,
        pos: Position,
        rec_size: u32,
    ) -> Result<(), HintError> {
        let mut state = self.lock_state()?;
        let must_rotate = state.active.as_ref().is_some_and(|b| {
            b.chunk != pos.chunk_id || b.len() >= self.config.buffer_max_items
        });
        if must_rotate {
            state.rotate();
        }
        if state.active.is_none() {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.active = Some(HintBuffer::new(seq, pos.chunk_id));
        }
        if let Some(active) = state.active.as_mut() {
            active.set(
                HintItem {
                    key_hash: ki.hash,
                    key: ki.string_key.clone(),
                    offset: pos.offset,
                    meta,
                },
                pos.offset + rec_size,
            );
        }
        Ok(())
    }

    /// Moves the active buffer to the pending queue.
    pub fn force_rotate(&self) -> Result<(), HintError> {
        self.lock_state()?.rotate();
        Ok(())
    }

    /// Searches only the in-memory buffers, newest first.
    pub fn buffered_lookup(&self, hash: u64, key: &str) -> Result<KeyLookup, HintError> {
        Ok(self.lock_state()?.lookup_buffers(hash, key))
    }

    /// Finds the newest hint for an exact key: buffers first, then segments
    /// from newest to oldest.
    pub fn get_item(&self, hash: u64, key: &str) -> Result<Option<HintEntry>, HintError> {
        let ids: Vec<HintSegmentId> = {
            let state = self.lock_state()?;
            if let KeyLookup::Found(entry) = state.lookup_buffers(hash, key) {
                return Ok(Some(entry));
            }
            state
                .segments
                .iter()
                .rev()
                .flat_map(|(&chunk, splits)| {
                    splits.iter().rev().map(move |&s| HintSegmentId::new(chunk, s))
                })
                .collect()
        };

        for id in ids {
            let segment = match self.load_segment(id) {
                Ok(s) => s,
                Err(HintError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(segment = %id, error = %e, "skipping unreadable hint segment");
                    continue;
                }
            };
            if let HintLookup::Found(item) = segment.find(hash, key)? {
                return Ok(Some(HintEntry {
                    meta: item.meta,
                    pos: Position::new(id.chunk_id, item.offset),
                }));
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Dump & merge
    // --------------------------------------------------------------------------------------------

    /// Writes pending buffers out as segments, oldest first, stopping at
    /// the first one that may not be dumped yet. Without `force`, buffers
    /// younger than the dump delay are left alone.
    ///
    /// Returns the number of segments written.
    pub fn dump(&self, force: bool) -> Result<usize, HintError> {
        let _io = self.lock_io()?;
        let mut written = 0;
        loop {
            let (seq, id, max_offset, items) = {
                let state = self.lock_state()?;
                let Some(front) = state.pending.front() else {
                    break;
                };
                if state.max_dumpable_chunk.is_some_and(|max| front.chunk > max) {
                    break;
                }
                let young = front
                    .rotated_at
                    .is_some_and(|t| t.elapsed() < self.config.dump_delay);
                if !force && young {
                    break;
                }
                (
                    front.seq,
                    HintSegmentId::new(front.chunk, state.next_split(front.chunk)),
                    front.max_offset,
                    front.items(),
                )
            };

            segment::write_segment(&self.home, id, max_offset, &items)?;

            let mut state = self.lock_state()?;
            if state.pending.front().is_some_and(|b| b.seq == seq) {
                state.pending.pop_front();
            }
            state.register(id);
            written += 1;
            debug!(segment = %id, items = items.len(), max_offset, "hint buffer dumped");
        }
        Ok(written)
    }

    /// Collapses each chunk's segments into one and registers every key
    /// that shares its hash with another key in the collision table.
    pub fn merge(&self) -> Result<(), HintError> {
        let _io = self.lock_io()?;
        let layout: Vec<(u32, Vec<u32>)> = self
            .lock_state()?
            .segments
            .iter()
            .map(|(&chunk, splits)| (chunk, splits.iter().copied().collect()))
            .collect();

        // hash → key → newest known location, across all chunks.
        let mut by_hash: HashMap<u64, HashMap<String, HintEntry>> = HashMap::new();
        let mut merged_chunks = 0usize;

        for (chunk, splits) in layout {
            let mut merged: HashMap<(u64, String), HintItem> = HashMap::new();
            let mut max_offset = 0u32;
            for &split in &splits {
                let id = HintSegmentId::new(chunk, split);
                let seg = HintSegment::open(&segment::segment_path(&self.home, id))?;
                max_offset = max_offset.max(seg.header.max_offset);
                for item in seg.items()? {
                    merged.insert((item.key_hash, item.key.clone()), item);
                }
            }

            let mut items: Vec<HintItem> = merged.into_values().collect();
            items.sort_unstable_by_key(|i| i.offset);
            for item in &items {
                by_hash.entry(item.key_hash).or_default().insert(
                    item.key.clone(),
                    HintEntry {
                        meta: item.meta,
                        pos: Position::new(chunk, item.offset),
                    },
                );
            }

            if splits.len() < 2 {
                continue;
            }
            let Some(&last) = splits.last() else { continue };
            let target = HintSegmentId::new(chunk, last);
            segment::write_segment(&self.home, target, max_offset, &items)?;
            for &split in &splits[..splits.len() - 1] {
                let id = HintSegmentId::new(chunk, split);
                remove_if_exists(&segment::segment_path(&self.home, id))?;
                self.lock_state()?.unregister(id);
            }
            self.lock_state()?.cache.remove(&target);
            merged_chunks += 1;
        }

        let registered = self.register_collisions(by_hash)?;
        info!(merged_chunks, registered, "hint segments merged");
        Ok(())
    }

    fn register_collisions(
        &self,
        by_hash: HashMap<u64, HashMap<String, HintEntry>>,
    ) -> Result<usize, HintError> {
        let mut registered = 0;
        // Held across registration so a concurrent `set` either lands in a
        // buffer we consult, or refreshes the entry after we insert it.
        let state = self.lock_state()?;
        for (hash, keys) in by_hash.into_iter().filter(|(_, keys)| keys.len() > 1) {
            for (key, on_disk) in keys {
                if self.collisions.get(hash, &key)?.is_some() {
                    continue;
                }
                let newest = match state.lookup_buffers(hash, &key) {
                    KeyLookup::Found(entry) => entry,
                    _ => on_disk,
                };
                self.collisions.set(CollisionEntry {
                    key_hash: hash,
                    key,
                    meta: newest.meta,
                    pos: newest.pos,
                })?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    // --------------------------------------------------------------------------------------------
    // Segment management
    // --------------------------------------------------------------------------------------------

    /// Opens (or returns the cached) validated segment.
    pub fn load_segment(&self, id: HintSegmentId) -> Result<Arc<HintSegment>, HintError> {
        if let Some(seg) = self.lock_state()?.cache.get(&id) {
            return Ok(Arc::clone(seg));
        }
        let seg = Arc::new(HintSegment::open(&segment::segment_path(&self.home, id))?);
        let mut state = self.lock_state()?;
        if state.cache.len() >= SEGMENT_CACHE_CAPACITY {
            state.cache.clear();
        }
        state.cache.insert(id, Arc::clone(&seg));
        Ok(seg)
    }

    /// Writes a segment directly, bypassing the buffers. Used by recovery
    /// to cover data that no segment describes.
    pub fn write_segment(
        &self,
        id: HintSegmentId,
        max_offset: u32,
        items: &[HintItem],
    ) -> Result<(), HintError> {
        let _io = self.lock_io()?;
        segment::write_segment(&self.home, id, max_offset, items)?;
        self.lock_state()?.register(id);
        info!(segment = %id, items = items.len(), max_offset, "hint segment written");
        Ok(())
    }

    /// Replaces every segment and pending buffer of `chunk` with a single
    /// segment holding `items`.
    pub fn replace_chunk_segments(
        &self,
        chunk: u32,
        items: &[HintItem],
        max_offset: u32,
    ) -> Result<(), HintError> {
        let _io = self.lock_io()?;
        self.remove_chunk_locked(chunk)?;
        let id = HintSegmentId::new(chunk, 1);
        segment::write_segment(&self.home, id, max_offset, items)?;
        self.lock_state()?.register(id);
        debug!(chunk, items = items.len(), max_offset, "chunk hints rebuilt");
        Ok(())
    }

    /// Deletes every segment and pending buffer of `chunk`.
    pub fn delete_chunk(&self, chunk: u32) -> Result<(), HintError> {
        let _io = self.lock_io()?;
        self.remove_chunk_locked(chunk)
    }

    fn remove_chunk_locked(&self, chunk: u32) -> Result<(), HintError> {
        let splits = {
            let mut state = self.lock_state()?;
            state.pending.retain(|b| b.chunk != chunk);
            state.cache.retain(|id, _| id.chunk_id != chunk);
            state.segments.remove(&chunk).unwrap_or_default()
        };
        for split in splits {
            remove_if_exists(&segment::segment_path(
                &self.home,
                HintSegmentId::new(chunk, split),
            ))?;
        }
        Ok(())
    }

    pub fn delete_segment(&self, id: HintSegmentId) -> Result<(), HintError> {
        let _io = self.lock_io()?;
        remove_if_exists(&segment::segment_path(&self.home, id))?;
        self.lock_state()?.unregister(id);
        Ok(())
    }

    /// Header-only read of a segment's coverage.
    pub fn read_max_offset(&self, id: HintSegmentId) -> Result<u32, HintError> {
        Ok(segment::read_header(&segment::segment_path(&self.home, id))?.max_offset)
    }

    /// Segments of `chunk` in split order.
    pub fn segments_for(&self, chunk: u32) -> Result<Vec<HintSegmentId>, HintError> {
        Ok(self
            .lock_state()?
            .segments
            .get(&chunk)
            .map(|splits| {
                splits
                    .iter()
                    .map(|&s| HintSegmentId::new(chunk, s))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Chunks that have at least one segment on disk.
    pub fn chunks_with_segments(&self) -> Result<Vec<u32>, HintError> {
        Ok(self.lock_state()?.segments.keys().copied().collect())
    }

    /// Drops cached segments of chunks `lo..=hi`.
    pub fn clear_chunks(&self, lo: u32, hi: u32) -> Result<(), HintError> {
        self.lock_state()?
            .cache
            .retain(|id, _| id.chunk_id < lo || id.chunk_id > hi);
        Ok(())
    }

    pub fn set_max_dumpable_chunk(&self, chunk: Option<u32>) -> Result<(), HintError> {
        self.lock_state()?.max_dumpable_chunk = chunk;
        Ok(())
    }

    /// Newest segment id written so far.
    pub fn max_dumped_id(&self) -> Result<HintSegmentId, HintError> {
        Ok(self.lock_state()?.max_dumped)
    }

    // --------------------------------------------------------------------------------------------
    // GC / merge exclusion
    // --------------------------------------------------------------------------------------------

    /// Raises the GC flag and waits for a running merge to finish.
    pub fn begin_gc(&self) -> Result<(), HintError> {
        let mut phase = self.lock_phase()?;
        phase.gc = true;
        while phase.merging {
            debug!("GC waiting for hint merge to finish");
            phase = self
                .phase_cv
                .wait(phase)
                .map_err(|_| HintError::Internal("Condvar wait poisoned".into()))?;
        }
        Ok(())
    }

    pub fn end_gc(&self) -> Result<(), HintError> {
        self.lock_phase()?.gc = false;
        self.phase_cv.notify_all();
        Ok(())
    }

    /// Marks a merge as running unless GC is active.
    pub fn try_begin_merge(&self) -> Result<bool, HintError> {
        let mut phase = self.lock_phase()?;
        if phase.gc || phase.merging {
            return Ok(false);
        }
        phase.merging = true;
        Ok(true)
    }

    pub fn end_merge(&self) -> Result<(), HintError> {
        self.lock_phase()?.merging = false;
        self.phase_cv.notify_all();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Stops the worker and dumps every buffer.
    pub fn close(&self) -> Result<(), HintError> {
        if let Some(worker) = self.lock_worker()?.take() {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                error!("hint worker panicked");
            }
        }
        self.set_max_dumpable_chunk(None)?;
        self.force_rotate()?;
        let written = self.dump(true)?;
        info!(written, max_dumped = %self.max_dumped_id()?, "hint manager closed");
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, HintState>, HintError> {
        self.state
            .lock()
            .map_err(|_| HintError::Internal("Mutex poisoned".into()))
    }

    fn lock_io(&self) -> Result<MutexGuard<'_, ()>, HintError> {
        self.io
            .lock()
            .map_err(|_| HintError::Internal("Mutex poisoned".into()))
    }

    fn lock_phase(&self) -> Result<MutexGuard<'_, HintPhase>, HintError> {
        self.phase
            .lock()
            .map_err(|_| HintError::Internal("Mutex poisoned".into()))
    }

    fn lock_worker(&self) -> Result<MutexGuard<'_, Option<Worker>>, HintError> {
        self.worker
            .lock()
            .map_err(|_| HintError::Internal("Mutex poisoned".into()))
    }
}

impl Drop for HintManager {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                let _ = worker.stop.send(());
                // The worker only holds a weak reference, so it may be the
                // one running this drop; never join ourselves.
                if worker.handle.thread().id() != thread::current().id() {
                    let _ = worker.handle.join();
                }
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), HintError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
