//! # Collision Table
//!
//! The hash-tree keeps one entry per key hash. When two distinct keys share
//! a hash, the tree can only point at one of them; this table remembers the
//! exact position and version of *every* key known to collide, keyed by
//! `(hash, key)`.
//!
//! Reads consult it first, GC keeps it in step with relocated records, and
//! the hint merge registers newly discovered collisions in it. It is
//! persisted to `collision.tbl` on close; a missing or damaged file yields
//! an empty table.


use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crossbeam::sync::ShardedLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::position::Position;
use crate::record::VersionedMeta;
use crate::snapshot::{self, SnapshotError};

pub const COLLISION_FILE_NAME: &str = "collision.tbl";
const COLLISION_MAGIC: &[u8; 4] = b"COLL";
const COLLISION_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum CollisionError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Last known location of one colliding key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionEntry {
    pub key_hash: u64,
    pub key: String,
    pub meta: VersionedMeta,
    pub pos: Position,
}

impl Encode for CollisionEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key_hash.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.meta.version.encode_to(buf)?;
        self.meta.value_hash.encode_to(buf)?;
        self.pos.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CollisionEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key_hash, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_hash, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (pos, n) = Position::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key_hash,
                key,
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

type Buckets = HashMap<u64, HashMap<String, CollisionEntry>>;

/// Concurrent `(hash, key) → entry` map.
pub struct CollisionTable {
    path: PathBuf,
    items: ShardedLock<Buckets>,
}

impl CollisionTable {
    /// Loads the table persisted in `home`. Never fails on bad content.
    pub fn open(home: impl AsRef<Path>) -> Self {
        let path = home.as_ref().join(COLLISION_FILE_NAME);
        let items = if path.exists() {
            match Self::read(&path) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "collision table unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        let keys: usize = items.values().map(HashMap::len).sum();
        info!(keys, hashes = items.len(), "collision table loaded");
        Self {
            path,
            items: ShardedLock::new(items),
        }
    }

    fn read(path: &Path) -> Result<Buckets, CollisionError> {
        let body = snapshot::read_framed(path, COLLISION_MAGIC, COLLISION_FORMAT)?;
        let (entries, _) = encoding::decode_vec::<CollisionEntry>(&body)?;
        let mut items: Buckets = HashMap::new();
        for e in entries {
            items.entry(e.key_hash).or_default().insert(e.key.clone(), e);
        }
        Ok(items)
    }

    pub fn get(&self, hash: u64, key: &str) -> Result<Option<CollisionEntry>, CollisionError> {
        Ok(self
            .read_lock()?
            .get(&hash)
            .and_then(|keys| keys.get(key))
            .cloned())
    }

    /// `true` if any key with this hash is registered.
    pub fn contains_hash(&self, hash: u64) -> Result<bool, CollisionError> {
        Ok(self.read_lock()?.contains_key(&hash))
    }

    pub fn set(&self, entry: CollisionEntry) -> Result<(), CollisionError> {
        debug!(hash = entry.key_hash, key = %entry.key, pos = %entry.pos, "collision entry set");
        self.write_lock()?
            .entry(entry.key_hash)
            .or_default()
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Replaces the entry only if the key is already registered.
    /// Returns whether it was.
    pub fn refresh(&self, entry: CollisionEntry) -> Result<bool, CollisionError> {
        let mut items = self.write_lock()?;
        match items
            .get_mut(&entry.key_hash)
            .and_then(|keys| keys.get_mut(&entry.key))
        {
            Some(slot) => {
                *slot = entry;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves an entry from `old` to `new` if it still points at `old`.
    pub fn update_position(
        &self,
        hash: u64,
        key: &str,
        old: Position,
        new: Position,
    ) -> Result<bool, CollisionError> {
        let mut items = self.write_lock()?;
        match items.get_mut(&hash).and_then(|keys| keys.get_mut(key)) {
            Some(entry) if entry.pos == old => {
                entry.pos = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Number of registered keys.
    pub fn len(&self) -> Result<usize, CollisionError> {
        Ok(self.read_lock()?.values().map(HashMap::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, CollisionError> {
        Ok(self.read_lock()?.is_empty())
    }

    /// Persists the table atomically.
    pub fn dump(&self) -> Result<(), CollisionError> {
        let mut entries: Vec<CollisionEntry> = self
            .read_lock()?
            .values()
            .flat_map(|keys| keys.values().cloned())
            .collect();
        entries.sort_by(|a, b| (a.key_hash, &a.key).cmp(&(b.key_hash, &b.key)));

        let mut body = Vec::new();
        encoding::encode_vec(&entries, &mut body)?;
        snapshot::write_framed(&self.path, COLLISION_MAGIC, COLLISION_FORMAT, &body)?;
        info!(keys = entries.len(), "collision table dumped");
        Ok(())
    }

    fn read_lock(
        &self,
    ) -> Result<crossbeam::sync::ShardedLockReadGuard<'_, Buckets>, CollisionError> {
        self.items
            .read()
            .map_err(|_| CollisionError::Internal("ShardedLock poisoned".into()))
    }

    fn write_lock(
        &self,
    ) -> Result<crossbeam::sync::ShardedLockWriteGuard<'_, Buckets>, CollisionError> {
        self.items
            .write()
            .map_err(|_| CollisionError::Internal("ShardedLock poisoned".into()))
    }
}
