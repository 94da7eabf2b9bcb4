//! # Hash Tree
//!
//! The authoritative in-memory index of a bucket: key hash → latest
//! `(VersionedMeta, Position)`. One entry per hash; when keys collide the
//! entry belongs to whichever was written last and the collision table
//! tracks the rest.
//!
//! The tree can be snapshotted to `{chunk:03}.{split:03}.hash`, tagged with
//! the newest hint segment it fully incorporates, so recovery only has to
//! replay hints past that point.
//!
//! ## Directory listing
//!
//! [`HashTree::list_dir`] exposes the hash space as a 16-ary tree of hex
//! nibbles, which lets two replicas compare buckets level by level:
//!
//! ```text
//! list_dir("")                 -> "0/ 12 3405691582", "1/ 9 ...", ...
//! list_dir("1a")               -> "1a0/ 2 ...", ...
//! list_dir("1a2b3c4d5e6f7081") -> "1a2b3c4d5e6f7081 4 2882400001"
//! ```

#[cfg(test)]
mod tests;

use std::{collections::HashMap, path::Path};

use crossbeam::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::key::KeyDescriptor;
use crate::position::{HintSegmentId, Position};
use crate::record::VersionedMeta;
use crate::snapshot::{self, SnapshotError};

pub const SNAPSHOT_SUFFIX: &str = "hash";
const SNAPSHOT_MAGIC: &[u8; 4] = b"HTRE";
const SNAPSHOT_FORMAT: u32 = 1;

/// Hex digits in a full key hash.
const HASH_NIBBLES: usize = 16;

#[derive(Debug, Error)]
pub enum HashTreeError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("invalid directory path {0:?}")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One snapshot row.
struct TreeEntry {
    hash: u64,
    meta: VersionedMeta,
    pos: Position,
}

impl Encode for TreeEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.hash.encode_to(buf)?;
        self.meta.version.encode_to(buf)?;
        self.meta.value_hash.encode_to(buf)?;
        self.pos.encode_to(buf)
    }
}

impl Decode for TreeEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (hash, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_hash, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (pos, n) = Position::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                hash,
                meta: VersionedMeta {
                    version,
                    value_hash,
                },
                pos,
            },
            offset,
        ))
    }
}

/// File name of the snapshot tagged with `id`.
pub fn snapshot_file_name(id: HintSegmentId) -> String {
    format!("{}.{SNAPSHOT_SUFFIX}", id.file_stem())
}

type Items = HashMap<u64, (VersionedMeta, Position)>;

#[derive(Default)]
pub struct HashTree {
    items: ShardedLock<Items>,
}

impl HashTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ki: &KeyDescriptor) -> Result<Option<(VersionedMeta, Position)>, HashTreeError> {
        Ok(self.read_lock()?.get(&ki.hash).copied())
    }

    pub fn set(
        &self,
        ki: &KeyDescriptor,
        meta: VersionedMeta,
        pos: Position,
    ) -> Result<(), HashTreeError> {
        self.set_hash(ki.hash, meta, pos)
    }

    pub(crate) fn set_hash(
        &self,
        hash: u64,
        meta: VersionedMeta,
        pos: Position,
    ) -> Result<(), HashTreeError> {
        self.write_lock()?.insert(hash, (meta, pos));
        Ok(())
    }

    /// Moves the entry for `ki` from `old` to `new` if it still points at
    /// `old`. Returns `false` when a newer write got there first.
    pub fn update_position(
        &self,
        ki: &KeyDescriptor,
        old: Position,
        new: Position,
    ) -> Result<bool, HashTreeError> {
        let mut items = self.write_lock()?;
        match items.get_mut(&ki.hash) {
            Some((_, pos)) if *pos == old => {
                *pos = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize, HashTreeError> {
        Ok(self.read_lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, HashTreeError> {
        Ok(self.read_lock()?.is_empty())
    }

    /// Number of entries whose version is positive.
    pub fn live_count(&self) -> Result<usize, HashTreeError> {
        Ok(self
            .read_lock()?
            .values()
            .filter(|(meta, _)| meta.is_live())
            .count())
    }

    /// Replaces the whole content with a snapshot from disk.
    pub fn load(&self, path: &Path) -> Result<(), HashTreeError> {
        let body = snapshot::read_framed(path, SNAPSHOT_MAGIC, SNAPSHOT_FORMAT)?;
        let (entries, _) = encoding::decode_vec::<TreeEntry>(&body)?;
        let count = entries.len();
        let items: Items = entries
            .into_iter()
            .map(|e| (e.hash, (e.meta, e.pos)))
            .collect();
        *self.write_lock()? = items;
        info!(path = %path.display(), entries = count, "hash tree loaded");
        Ok(())
    }

    /// Writes a snapshot of the current content.
    pub fn dump(&self, path: &Path) -> Result<(), HashTreeError> {
        let mut entries: Vec<TreeEntry> = self
            .read_lock()?
            .iter()
            .map(|(&hash, &(meta, pos))| TreeEntry { hash, meta, pos })
            .collect();
        entries.sort_unstable_by_key(|e| e.hash);

        let mut body = Vec::with_capacity(entries.len() * 24 + 4);
        encoding::encode_vec(&entries, &mut body)?;
        snapshot::write_framed(path, SNAPSHOT_MAGIC, SNAPSHOT_FORMAT, &body)?;
        info!(path = %path.display(), entries = entries.len(), "hash tree dumped");
        Ok(())
    }

    /// Lists the hash-space directory named by a hex `prefix`.
    ///
    /// Below a full hash, every non-empty child nibble yields
    /// `"{prefix}{nibble}/ {count} {hash_sum}"`, where `hash_sum` is the
    /// wrapping sum of the children's value hashes. A full 16-digit prefix
    /// yields the item itself as `"{hash} {version} {value_hash}"`.
    pub fn list_dir(&self, prefix: &str) -> Result<Vec<String>, HashTreeError> {
        let prefix = prefix.to_ascii_lowercase();
        if prefix.len() > HASH_NIBBLES || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashTreeError::InvalidPath(prefix));
        }
        let depth = prefix.len();
        let want = if depth == 0 {
            0
        } else {
            u64::from_str_radix(&prefix, 16).map_err(|_| HashTreeError::InvalidPath(prefix.clone()))?
        };

        let items = self.read_lock()?;

        if depth == HASH_NIBBLES {
            return Ok(items
                .get(&want)
                .map(|(meta, _)| {
                    vec![format!("{prefix} {} {}", meta.version, meta.value_hash)]
                })
                .unwrap_or_default());
        }

        let mut children = [(0usize, 0u32); 16];
        let child_shift = 4 * (HASH_NIBBLES - depth - 1);
        for (&hash, (meta, _)) in items.iter() {
            if depth > 0 && hash >> (4 * (HASH_NIBBLES - depth)) != want {
                continue;
            }
            let nibble = ((hash >> child_shift) & 0xf) as usize;
            let (count, sum) = &mut children[nibble];
            *count += 1;
            *sum = sum.wrapping_add(meta.value_hash);
        }
        drop(items);

        let lines: Vec<String> = children
            .iter()
            .enumerate()
            .filter(|(_, (count, _))| *count > 0)
            .map(|(nibble, (count, sum))| format!("{prefix}{nibble:x}/ {count} {sum}"))
            .collect();
        debug!(prefix = %prefix, children = lines.len(), "hash tree directory listed");
        Ok(lines)
    }

    fn read_lock(&self) -> Result<ShardedLockReadGuard<'_, Items>, HashTreeError> {
        self.items
            .read()
            .map_err(|_| HashTreeError::Internal("ShardedLock poisoned".into()))
    }

    fn write_lock(&self) -> Result<ShardedLockWriteGuard<'_, Items>, HashTreeError> {
        self.items
            .write()
            .map_err(|_| HashTreeError::Internal("ShardedLock poisoned".into()))
    }
}
