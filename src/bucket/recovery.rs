//! Bucket startup: rebuild the hash tree from the newest usable snapshot
//! plus the hint segments written after it, and make sure every byte of
//! data is described by some hint segment.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    thread,
};

use crossbeam::sync::ShardedLock;
use tracing::{debug, error, info, warn};

use super::{Bucket, BucketConfig, BucketError};
use crate::collision::{CollisionEntry, CollisionTable};
use crate::datalog::DataLog;
use crate::gc::{self, GcEngine};
use crate::hint::HintManager;
use crate::htree::{self, HashTree};
use crate::key::KeyHasher;
use crate::position::{HintSegmentId, Position};

/// Keeps the background hint merge away while recovery rewrites segments.
struct MergeFence(Arc<HintManager>);

impl MergeFence {
    fn acquire(hints: &Arc<HintManager>) -> Result<Option<Self>, BucketError> {
        Ok(hints
            .try_begin_merge()?
            .then(|| MergeFence(Arc::clone(hints))))
    }
}

impl Drop for MergeFence {
    fn drop(&mut self) {
        if let Err(e) = self.0.end_merge() {
            error!("failed to release hint merge fence: {e}");
        }
    }
}

impl Bucket {
    /// Opens (or creates) the bucket stored in `home`.
    pub fn open(home: impl AsRef<Path>, config: BucketConfig) -> Result<Self, BucketError> {
        let home = home.as_ref().to_path_buf();
        fs::create_dir_all(&home)?;

        let datalog = Arc::new(DataLog::open(&home, config.data_file_max)?);
        let collisions = Arc::new(CollisionTable::open(&home));
        let hints = HintManager::open(&home, config.hint.clone(), Arc::clone(&collisions))?;
        let htree = HashTree::new();
        let fence = MergeFence::acquire(&hints)?;

        let max_chunk = datalog.max_chunk()?;
        let loaded = load_newest_snapshot(&home, &htree, max_chunk)?;

        // Segments without data describe nothing.
        for chunk in hints.chunks_with_segments()? {
            if datalog.chunk_size(chunk)?.is_none() {
                warn!(chunk, "deleting hint segments of a missing data chunk");
                hints.delete_chunk(chunk)?;
            }
        }

        let chunks: Vec<u32> = datalog.chunk_sizes()?.into_keys().collect();
        for &chunk in chunks.iter().filter(|&&c| c >= loaded.chunk_id) {
            ensure_chunk_hints(&datalog, &hints, chunk, config.key_hasher, Some(loaded))?;
        }

        // Registered keys move with the replayed records too; the table on
        // disk only reflects the last clean close.
        let mut tree_id = loaded;
        let mut replayed = 0usize;
        let mut refreshed = 0usize;
        for &chunk in chunks.iter().filter(|&&c| c >= loaded.chunk_id) {
            for id in hints.segments_for(chunk)? {
                if id <= loaded {
                    continue;
                }
                let segment = hints.load_segment(id)?;
                for item in segment.items()? {
                    let pos = Position::new(chunk, item.offset);
                    htree.set_hash(item.key_hash, item.meta, pos)?;
                    if collisions.contains_hash(item.key_hash)?
                        && collisions.refresh(CollisionEntry {
                            key_hash: item.key_hash,
                            key: item.key,
                            meta: item.meta,
                            pos,
                        })?
                    {
                        refreshed += 1;
                    }
                    replayed += 1;
                }
                tree_id = id;
            }
        }

        let older: Vec<u32> = chunks
            .iter()
            .copied()
            .filter(|&c| c < loaded.chunk_id)
            .collect();
        let healer = if older.is_empty() {
            drop(fence);
            None
        } else {
            Some(spawn_healer(
                Arc::clone(&datalog),
                Arc::clone(&hints),
                config.key_hasher,
                older,
                fence,
            )?)
        };

        let gc = GcEngine::open(&home);
        info!(
            bucket = config.bucket_id,
            home = %home.display(),
            snapshot = %loaded,
            tree_id = %tree_id,
            replayed,
            refreshed,
            keys = htree.len()?,
            collisions = collisions.len()?,
            "bucket opened"
        );

        Ok(Self {
            id: config.bucket_id,
            home,
            config,
            write_lock: Mutex::new(()),
            layout: ShardedLock::new(()),
            datalog,
            hints,
            htree,
            collisions,
            tree_id: Mutex::new(tree_id),
            gc,
            healer: Mutex::new(healer),
        })
    }
}

/// Loads the newest snapshot whose chunk still exists and deletes every
/// other one. Returns the id the tree now reflects.
fn load_newest_snapshot(
    home: &Path,
    htree: &HashTree,
    max_chunk: Option<u32>,
) -> Result<HintSegmentId, BucketError> {
    let mut snapshots: Vec<HintSegmentId> = Vec::new();
    for entry in fs::read_dir(home)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = HintSegmentId::parse_file_name(&name.to_string_lossy(), htree::SNAPSHOT_SUFFIX) {
            snapshots.push(id);
        }
    }
    snapshots.sort_unstable_by(|a, b| b.cmp(a));

    let mut loaded: Option<HintSegmentId> = None;
    let mut attempted = false;
    for id in snapshots {
        let path = home.join(htree::snapshot_file_name(id));
        let in_range = max_chunk.is_some_and(|max| id.chunk_id <= max);
        if !in_range {
            info!(snapshot = %id, "deleting hash tree snapshot ahead of the data");
        } else if !attempted {
            attempted = true;
            match htree.load(&path) {
                Ok(()) => {
                    loaded = Some(id);
                    continue;
                }
                Err(e) => warn!(snapshot = %id, error = %e, "hash tree snapshot unreadable, deleting"),
            }
        } else {
            debug!(snapshot = %id, "deleting superseded hash tree snapshot");
        }
        fs::remove_file(&path)?;
    }
    Ok(loaded.unwrap_or(HintSegmentId::ZERO))
}

/// Makes sure hint segments describe all of `chunk`'s data, writing a new
/// segment for any uncovered tail. Invalid segments are deleted together
/// with every later split of the chunk. A synthesized segment always sorts
/// after `floor` when it belongs to the same chunk.
pub(crate) fn ensure_chunk_hints(
    datalog: &DataLog,
    hints: &HintManager,
    chunk: u32,
    hasher: KeyHasher,
    floor: Option<HintSegmentId>,
) -> Result<Option<HintSegmentId>, BucketError> {
    let Some(size) = datalog.chunk_size(chunk)? else {
        return Ok(None);
    };

    let mut covered = 0u32;
    let mut highest_split = 0u32;
    let mut broken = false;
    for id in hints.segments_for(chunk)? {
        highest_split = highest_split.max(id.split_id);
        if broken {
            warn!(segment = %id, "deleting hint segment that follows a bad one");
            hints.delete_segment(id)?;
            continue;
        }
        match hints.load_segment(id) {
            Ok(segment) if segment.header.max_offset <= size => {
                covered = covered.max(segment.header.max_offset);
            }
            Ok(segment) => {
                warn!(
                    segment = %id,
                    max_offset = segment.header.max_offset,
                    size,
                    "hint segment covers more than its chunk holds, deleting"
                );
                hints.delete_segment(id)?;
                broken = true;
            }
            Err(e) => {
                warn!(segment = %id, error = %e, "bad hint segment, deleting");
                hints.delete_segment(id)?;
                broken = true;
            }
        }
    }
    if covered >= size {
        return Ok(None);
    }

    let (items, end) = gc::scan_chunk_hints(datalog, chunk, covered, hasher)?;
    if items.is_empty() {
        debug!(chunk, covered, size, "uncovered chunk tail holds no valid record");
        return Ok(None);
    }
    let mut split = highest_split + 1;
    if let Some(floor) = floor.filter(|f| f.chunk_id == chunk) {
        split = split.max(floor.split_id + 1);
    }
    let id = HintSegmentId::new(chunk, split);
    hints.write_segment(id, end, &items)?;
    info!(segment = %id, from = covered, to = end, items = items.len(), "hint segment rebuilt from data");
    Ok(Some(id))
}

fn spawn_healer(
    datalog: Arc<DataLog>,
    hints: Arc<HintManager>,
    hasher: KeyHasher,
    chunks: Vec<u32>,
    fence: Option<MergeFence>,
) -> Result<thread::JoinHandle<()>, BucketError> {
    let handle = thread::Builder::new()
        .name("hstore-heal".into())
        .spawn(move || {
            let _fence = fence;
            let mut rebuilt = 0usize;
            for chunk in chunks {
                match ensure_chunk_hints(&datalog, &hints, chunk, hasher, None) {
                    Ok(Some(_)) => rebuilt += 1,
                    Ok(None) => {}
                    Err(e) => error!(chunk, error = %e, "hint coverage check failed"),
                }
            }
            debug!(rebuilt, "hint coverage check finished");
        })?;
    Ok(handle)
}
