//! # Garbage Collection
//!
//! Online compaction of a range of data chunks. GC streams every record
//! of each source chunk, re-checks it against the live indexes, and copies
//! the survivors into a destination chunk. Writers keep running the whole
//! time; every index change GC makes is a compare-and-set against the
//! position it read, so a concurrent write always wins.
//!
//! ## Phases
//!
//! ```text
//! idle ─► preparing ─► compacting(src = begin ..= end) ─► finishing ─► idle
//!              │                 │                             ▲
//!              └──── error ──────┴─────────────────────────────┘
//! ```
//!
//! - **preparing**: fence off the hint merge worker, flush and merge hint
//!   segments (which registers hash collisions), drop tree snapshots.
//! - **compacting**: per source chunk, copy live records to the destination
//!   (the source itself, rewritten through a temp file, or an earlier
//!   chunk), then rebuild the destination's hints and delete the source.
//! - **finishing**: always runs; lifts the fences, writes a fresh tree
//!   snapshot and records the run in the persisted audit history.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::sync::{ShardedLock, ShardedLockWriteGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::collision::{CollisionEntry, CollisionError, CollisionTable};
use crate::datalog::{DataLog, DataLogError, DataStreamWriter, record_size};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::hint::{HintError, HintItem, HintManager, KeyLookup};
use crate::htree::{self, HashTree, HashTreeError};
use crate::key::{KeyDescriptor, KeyHasher};
use crate::position::{HintSegmentId, Position};
use crate::record::{Record, VersionedMeta, now_secs};
use crate::snapshot::{self, SnapshotError};

pub const GC_HISTORY_FILE_NAME: &str = "gc.history";
pub(crate) const HISTORY_MAGIC: &[u8; 4] = b"GCHI";
pub(crate) const HISTORY_FORMAT: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GcError {
    /// Another GC run holds this bucket.
    #[error("GC already running")]
    AlreadyRunning,

    #[error("invalid GC range {begin}..={end}")]
    InvalidRange { begin: u32, end: u32 },

    #[error("Data log error: {0}")]
    DataLog(#[from] DataLogError),

    #[error("Hint error: {0}")]
    Hint(#[from] HintError),

    #[error("Hash tree error: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("Collision table error: {0}")]
    Collision(#[from] CollisionError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Audit records
// ------------------------------------------------------------------------------------------------

/// What GC did to one source chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcFileStats {
    pub src_chunk: u32,
    pub dst_chunk: u32,
    pub records: u64,
    pub released: u64,
    pub released_deleted: u64,
    pub bytes_before: u64,
    pub bytes_released: u64,
    pub bytes_released_deleted: u64,
    pub broken_bytes: u64,
}

impl Encode for GcFileStats {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.src_chunk.encode_to(buf)?;
        self.dst_chunk.encode_to(buf)?;
        self.records.encode_to(buf)?;
        self.released.encode_to(buf)?;
        self.released_deleted.encode_to(buf)?;
        self.bytes_before.encode_to(buf)?;
        self.bytes_released.encode_to(buf)?;
        self.bytes_released_deleted.encode_to(buf)?;
        self.broken_bytes.encode_to(buf)
    }
}

impl Decode for GcFileStats {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (src_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (dst_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let mut counters = [0u64; 7];
        for slot in counters.iter_mut() {
            let (v, n) = u64::decode_from(&buf[offset..])?;
            offset += n;
            *slot = v;
        }
        let [
            records,
            released,
            released_deleted,
            bytes_before,
            bytes_released,
            bytes_released_deleted,
            broken_bytes,
        ] = counters;
        Ok((
            Self {
                src_chunk,
                dst_chunk,
                records,
                released,
                released_deleted,
                bytes_before,
                bytes_released,
                bytes_released_deleted,
                broken_bytes,
            },
            offset,
        ))
    }
}

/// One GC invocation, as recorded in the audit history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcRun {
    pub begin_chunk: u32,
    pub end_chunk: u32,
    /// Source chunk being (or last) processed.
    pub src_chunk: u32,
    /// Destination chunk being (or last) written.
    pub dst_chunk: u32,
    pub running: bool,
    pub error: Option<String>,
    pub file_stats: Vec<GcFileStats>,
    pub started_at: u32,
    pub finished_at: Option<u32>,
}

impl GcRun {
    pub fn bytes_released(&self) -> u64 {
        self.file_stats.iter().map(|s| s.bytes_released).sum()
    }
}

impl Encode for GcRun {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.begin_chunk.encode_to(buf)?;
        self.end_chunk.encode_to(buf)?;
        self.src_chunk.encode_to(buf)?;
        self.dst_chunk.encode_to(buf)?;
        self.running.encode_to(buf)?;
        self.error.encode_to(buf)?;
        encoding::encode_vec(&self.file_stats, buf)?;
        self.started_at.encode_to(buf)?;
        self.finished_at.encode_to(buf)
    }
}

impl Decode for GcRun {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (begin_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (end_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (src_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (dst_chunk, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (running, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (error, n) = Option::<String>::decode_from(&buf[offset..])?;
        offset += n;
        let (file_stats, n) = encoding::decode_vec::<GcFileStats>(&buf[offset..])?;
        offset += n;
        let (started_at, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (finished_at, n) = Option::<u32>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                begin_chunk,
                end_chunk,
                src_chunk,
                dst_chunk,
                running,
                error,
                file_stats,
                started_at,
                finished_at,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// Everything a run touches, borrowed from the bucket.
pub(crate) struct GcContext<'a> {
    pub home: &'a Path,
    /// Taken exclusively while chunk contents are swapped under readers.
    pub layout: &'a ShardedLock<()>,
    pub datalog: &'a DataLog,
    pub hints: &'a HintManager,
    pub htree: &'a HashTree,
    pub collisions: &'a CollisionTable,
    pub key_hasher: KeyHasher,
    pub data_file_max: u32,
    pub dump_delay: Duration,
}

/// Liveness verdict for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Verdict {
    retain: bool,
    collision: bool,
    deleted: bool,
}

/// An index update to apply once the moved record is readable.
struct Relocation {
    ki: KeyDescriptor,
    meta: VersionedMeta,
    old: Position,
    new: Position,
    collision: bool,
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-bucket GC state and audit history.
pub struct GcEngine {
    history_path: PathBuf,
    running: AtomicBool,
    history: RwLock<Vec<GcRun>>,
}

impl GcEngine {
    /// Loads the audit history from `home`; a missing or damaged file
    /// yields an empty history.
    pub fn open(home: &Path) -> Self {
        let history_path = home.join(GC_HISTORY_FILE_NAME);
        let history = if history_path.exists() {
            match Self::read_history(&history_path) {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(path = %history_path.display(), error = %e, "GC history unreadable, starting empty");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        debug!(runs = history.len(), "GC history loaded");
        Self {
            history_path,
            running: AtomicBool::new(false),
            history: RwLock::new(history),
        }
    }

    fn read_history(path: &Path) -> Result<Vec<GcRun>, GcError> {
        let body = snapshot::read_framed(path, HISTORY_MAGIC, HISTORY_FORMAT)?;
        let (mut runs, _) = encoding::decode_vec::<GcRun>(&body)?;
        // A run still marked running did not survive the process.
        for run in runs.iter_mut().filter(|r| r.running) {
            run.running = false;
            run.error.get_or_insert_with(|| "interrupted".to_string());
        }
        Ok(runs)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Immutable copy of every recorded run, oldest first.
    pub fn history(&self) -> Vec<GcRun> {
        self.history
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Writes the audit history to disk.
    pub fn persist(&self) -> Result<(), GcError> {
        let runs = self.history();
        let mut body = Vec::new();
        encoding::encode_vec(&runs, &mut body)?;
        snapshot::write_framed(&self.history_path, HISTORY_MAGIC, HISTORY_FORMAT, &body)?;
        Ok(())
    }

    /// Compacts chunks `begin..=end`. Blocks until the run has finished.
    pub(crate) fn run(&self, ctx: &GcContext<'_>, begin: u32, end: u32) -> Result<GcRun, GcError> {
        if begin > end {
            return Err(GcError::InvalidRange { begin, end });
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(GcError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let idx = {
            let mut history = self.lock_history()?;
            history.push(GcRun {
                begin_chunk: begin,
                end_chunk: end,
                src_chunk: begin,
                dst_chunk: begin,
                running: true,
                started_at: now_secs(),
                ..GcRun::default()
            });
            history.len() - 1
        };
        info!(begin, end, "GC started");

        let result = self
            .prepare(ctx, end)
            .and_then(|()| self.compact(ctx, idx, begin, end));
        if let Err(e) = &result {
            error!(begin, end, error = %e, "GC failed");
        }
        let finished = self.finish(ctx, idx, result.as_ref().err());

        result?;
        finished?;
        let run = self
            .lock_history()?
            .get(idx)
            .cloned()
            .ok_or_else(|| GcError::Internal("GC run vanished from history".into()))?;
        info!(
            begin,
            end,
            files = run.file_stats.len(),
            bytes_released = run.bytes_released(),
            "GC finished"
        );
        Ok(run)
    }

    // --------------------------------------------------------------------------------------------
    // Phases
    // --------------------------------------------------------------------------------------------

    fn prepare(&self, ctx: &GcContext<'_>, end: u32) -> Result<(), GcError> {
        ctx.hints.begin_gc()?;
        ctx.hints.set_max_dumpable_chunk(Some(end.saturating_sub(1)))?;
        ctx.hints.force_rotate()?;
        thread::sleep(ctx.dump_delay);
        ctx.hints.dump(true)?;
        ctx.hints.merge()?;
        remove_tree_snapshots(ctx.home)?;
        debug!("GC prepared");
        Ok(())
    }

    fn compact(
        &self,
        ctx: &GcContext<'_>,
        idx: usize,
        begin: u32,
        end: u32,
    ) -> Result<(), GcError> {
        let active = ctx.datalog.active_chunk()?;
        let Some(last_sealed) = active.checked_sub(1) else {
            info!("GC: no sealed chunk to compact");
            return Ok(());
        };
        let end = end.min(last_sealed);
        if end < begin {
            info!(begin, end, active, "GC: range holds no sealed chunk");
            return Ok(());
        }
        ctx.hints.clear_chunks(begin, end)?;

        let mut dst = begin;
        for src in begin..=end {
            self.update_run(idx, |run| run.src_chunk = src)?;
            let Some(size) = ctx.datalog.chunk_size(src)? else {
                debug!(src, "GC: chunk missing, skipped");
                continue;
            };
            ctx.hints.clear_chunks(src, src)?;
            let (stats, last_dst) = self.compact_chunk(ctx, src, dst, size)?;
            dst = last_dst;

            info!(
                src = stats.src_chunk,
                dst = stats.dst_chunk,
                records = stats.records,
                released = stats.released,
                released_deleted = stats.released_deleted,
                bytes_before = stats.bytes_before,
                bytes_released = stats.bytes_released,
                broken_bytes = stats.broken_bytes,
                "GC: chunk compacted"
            );
            self.update_run(idx, |run| {
                run.dst_chunk = last_dst;
                run.file_stats.push(stats);
            })?;
        }
        Ok(())
    }

    /// Copies the live records of `src` into `dst` (spilling forward when
    /// it fills up). Returns the stats and the destination in use at the end.
    fn compact_chunk(
        &self,
        ctx: &GcContext<'_>,
        src: u32,
        mut dst: u32,
        size: u32,
    ) -> Result<(GcFileStats, u32), GcError> {
        let mut stats = GcFileStats {
            src_chunk: src,
            bytes_before: u64::from(size),
            ..GcFileStats::default()
        };

        let mut reader = ctx.datalog.stream_reader(src)?;
        let mut writer = ctx.datalog.stream_writer(dst, dst == src)?;
        let mut moved: Vec<Relocation> = Vec::new();
        let mut written_dsts = BTreeSet::new();

        while let Some((record, offset)) = reader.next()? {
            let old = Position::new(src, offset);
            let rec_size = u64::from(record_size(&record));
            stats.records += 1;

            let ki = KeyDescriptor::new(&record.key, ctx.key_hasher);
            let verdict = check_liveness(ctx, &ki, &record, old)?;
            if !verdict.retain {
                stats.released += 1;
                stats.bytes_released += rec_size;
                if verdict.deleted {
                    stats.released_deleted += 1;
                    stats.bytes_released_deleted += rec_size;
                }
                continue;
            }

            let full = writer.offset() > 0
                && u64::from(writer.offset()) + rec_size > u64::from(ctx.data_file_max);
            if full && !writer.in_place() && dst < src {
                self.seal_destination(ctx, writer, &mut moved)?;
                written_dsts.insert(dst);
                dst += 1;
                writer = ctx.datalog.stream_writer(dst, dst == src)?;
                debug!(src, dst, "GC: destination full, spilled");
            }

            let new = Position::new(dst, writer.append(&record)?);
            moved.push(Relocation {
                ki,
                meta: record.payload.meta,
                old,
                new,
                collision: verdict.collision,
            });
        }
        stats.broken_bytes = u64::from(reader.broken_bytes());
        drop(reader);

        self.seal_destination(ctx, writer, &mut moved)?;
        written_dsts.insert(dst);
        for &chunk in &written_dsts {
            rebuild_chunk_hints(ctx, chunk)?;
        }

        if dst != src {
            {
                let _layout = lock_layout(ctx)?;
                ctx.datalog.delete(src)?;
            }
            ctx.hints.delete_chunk(src)?;
        }
        stats.dst_chunk = dst;
        Ok((stats, dst))
    }

    /// Makes a destination durable and visible, then points the indexes at
    /// the records it received.
    fn seal_destination(
        &self,
        ctx: &GcContext<'_>,
        writer: DataStreamWriter,
        moved: &mut Vec<Relocation>,
    ) -> Result<(), GcError> {
        let chunk = writer.chunk();
        let _layout = lock_layout(ctx)?;
        if writer.in_place() {
            // Segments describing the old layout must not outlive it.
            ctx.hints.delete_chunk(chunk)?;
        }
        let size = writer.close(ctx.datalog)?;
        ctx.datalog.truncate(chunk, size)?;

        for r in moved.drain(..) {
            apply_relocation(ctx, &r)?;
        }
        Ok(())
    }

    fn finish(
        &self,
        ctx: &GcContext<'_>,
        idx: usize,
        failure: Option<&GcError>,
    ) -> Result<(), GcError> {
        let mut outcome: Result<(), GcError> = Ok(());
        let mut keep_first = |r: Result<(), GcError>| {
            if let Err(e) = r {
                error!(error = %e, "GC finishing step failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        };

        keep_first(ctx.hints.end_gc().map_err(GcError::from));
        keep_first(ctx.hints.set_max_dumpable_chunk(None).map_err(GcError::from));
        keep_first(write_tree_snapshot(ctx));

        let message = failure.map(|e| e.to_string());
        keep_first(self.update_run(idx, |run| {
            run.running = false;
            run.error = message;
            run.finished_at = Some(now_secs());
        }));
        keep_first(self.persist());
        outcome
    }

    fn update_run(&self, idx: usize, f: impl FnOnce(&mut GcRun)) -> Result<(), GcError> {
        let mut history = self.lock_history()?;
        let run = history
            .get_mut(idx)
            .ok_or_else(|| GcError::Internal("GC run vanished from history".into()))?;
        f(run);
        Ok(())
    }

    fn lock_history(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<GcRun>>, GcError> {
        self.history
            .write()
            .map_err(|_| GcError::Internal("RwLock poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Record-level helpers
// ------------------------------------------------------------------------------------------------

fn lock_layout<'a>(ctx: &GcContext<'a>) -> Result<ShardedLockWriteGuard<'a, ()>, GcError> {
    ctx.layout
        .write()
        .map_err(|_| GcError::Internal("ShardedLock poisoned".into()))
}

fn check_liveness(
    ctx: &GcContext<'_>,
    ki: &KeyDescriptor,
    record: &Record,
    at: Position,
) -> Result<Verdict, GcError> {
    let own_deleted = record.payload.meta.version <= 0;
    let Some((_, tree_pos)) = ctx.htree.get(ki)? else {
        error!(key = %ki.string_key, pos = %at, "GC: record hash missing from hash tree, keeping it");
        return Ok(Verdict {
            retain: true,
            collision: false,
            deleted: false,
        });
    };
    if tree_pos == at {
        return Ok(Verdict {
            retain: true,
            collision: false,
            deleted: own_deleted,
        });
    }

    if let Some(entry) = ctx.collisions.get(ki.hash, &ki.string_key)? {
        return Ok(Verdict {
            retain: entry.pos == at,
            collision: true,
            deleted: entry.meta.version <= 0,
        });
    }
    Ok(match ctx.hints.buffered_lookup(ki.hash, &ki.string_key)? {
        KeyLookup::Found(entry) => Verdict {
            retain: entry.pos == at,
            collision: true,
            deleted: entry.meta.version <= 0,
        },
        KeyLookup::OtherKey => Verdict {
            retain: true,
            collision: true,
            deleted: false,
        },
        KeyLookup::Absent => Verdict {
            retain: false,
            collision: false,
            deleted: own_deleted,
        },
    })
}

fn apply_relocation(ctx: &GcContext<'_>, r: &Relocation) -> Result<(), GcError> {
    let (hash, key) = (r.ki.hash, r.ki.string_key.as_str());
    if r.collision {
        if ctx.collisions.update_position(hash, key, r.old, r.new)? {
            return Ok(());
        }
        if ctx.collisions.get(hash, key)?.is_none() {
            ctx.collisions.set(CollisionEntry {
                key_hash: hash,
                key: key.to_string(),
                meta: r.meta,
                pos: r.new,
            })?;
        } else {
            debug!(key, "GC: collision entry moved by a writer, left alone");
        }
        return Ok(());
    }

    if !ctx.htree.update_position(&r.ki, r.old, r.new)? {
        warn!(key, old = %r.old, new = %r.new, "GC: hash tree entry moved by a writer, left alone");
    }
    ctx.collisions.update_position(hash, key, r.old, r.new)?;
    Ok(())
}

/// Regenerates the hint segment of `chunk` from its data.
fn rebuild_chunk_hints(ctx: &GcContext<'_>, chunk: u32) -> Result<(), GcError> {
    let (items, end) = scan_chunk_hints(ctx.datalog, chunk, 0, ctx.key_hasher)?;
    ctx.hints.replace_chunk_segments(chunk, &items, end)?;
    Ok(())
}

/// Derives hint items for the records of `chunk` from `from` onwards.
/// Returns them with the offset where the valid data ends.
pub(crate) fn scan_chunk_hints(
    datalog: &DataLog,
    chunk: u32,
    from: u32,
    hasher: KeyHasher,
) -> Result<(Vec<HintItem>, u32), DataLogError> {
    let mut reader = datalog.stream_reader_from(chunk, from)?;
    let mut items = Vec::new();
    while let Some((record, offset)) = reader.next()? {
        let ki = KeyDescriptor::new(&record.key, hasher);
        items.push(HintItem {
            key_hash: ki.hash,
            key: ki.string_key,
            offset,
            meta: record.payload.meta,
        });
    }
    Ok((items, reader.offset()))
}

fn write_tree_snapshot(ctx: &GcContext<'_>) -> Result<(), GcError> {
    let id = ctx.hints.max_dumped_id()?;
    if id == HintSegmentId::ZERO {
        return Ok(());
    }
    ctx.htree.dump(&ctx.home.join(htree::snapshot_file_name(id)))?;
    Ok(())
}

/// Deletes every hash-tree snapshot in `home`.
pub(crate) fn remove_tree_snapshots(home: &Path) -> Result<usize, std::io::Error> {
    let mut removed = 0;
    for entry in fs::read_dir(home)? {
        let entry = entry?;
        let name = entry.file_name();
        if HintSegmentId::parse_file_name(&name.to_string_lossy(), htree::SNAPSHOT_SUFFIX).is_some() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
