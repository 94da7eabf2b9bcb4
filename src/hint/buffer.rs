//! In-memory hint buffers.
//!
//! Each buffer collects hints for a single data chunk. The active buffer is
//! rotated into the pending queue when the chunk changes, when it is full,
//! or when it has aged past the dump interval; pending buffers become
//! segment files in rotation order.

use std::{collections::HashMap, time::Instant};

use super::segment::{HintItem, HintLookup};

pub(crate) struct HintBuffer {
    /// Unique per manager; lets a dump confirm it pops the buffer it wrote.
    pub seq: u64,
    pub chunk: u32,
    /// End of the data range covered so far.
    pub max_offset: u32,
    pub created_at: Instant,
    pub rotated_at: Option<Instant>,
    items: HashMap<u64, HashMap<String, HintItem>>,
    len: usize,
}

impl HintBuffer {
    pub fn new(seq: u64, chunk: u32) -> Self {
        Self {
            seq,
            chunk,
            max_offset: 0,
            created_at: Instant::now(),
            rotated_at: None,
            items: HashMap::new(),
            len: 0,
        }
    }

    /// Distinct keys held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records `item`, superseding any earlier hint for the same key.
    /// `end_offset` is where the record ends in the chunk.
    pub fn set(&mut self, item: HintItem, end_offset: u32) {
        let keys = self.items.entry(item.key_hash).or_default();
        if keys.insert(item.key.clone(), item).is_none() {
            self.len += 1;
        }
        self.max_offset = self.max_offset.max(end_offset);
    }

    pub fn lookup(&self, hash: u64, key: &str) -> HintLookup {
        match self.items.get(&hash) {
            None => HintLookup::Absent,
            Some(keys) => match keys.get(key) {
                Some(item) => HintLookup::Found(item.clone()),
                None => HintLookup::OtherKey,
            },
        }
    }

    /// Snapshot of the content in data-log order.
    pub fn items(&self) -> Vec<HintItem> {
        let mut items: Vec<HintItem> = self
            .items
            .values()
            .flat_map(|keys| keys.values().cloned())
            .collect();
        items.sort_unstable_by_key(|i| i.offset);
        items
    }
}
