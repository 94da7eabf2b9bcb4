//! Record positions and hint segment identifiers.
//!
//! A [`Position`] names one record inside the data log: the chunk file it
//! lives in and its byte offset within that chunk. Indexes persist positions
//! as a single `u64` (see [`Position::encode`]); all logic works on the
//! structured pair so encoded and decoded forms can never be mixed up.

use std::fmt;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Location of a record in the data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub chunk_id: u32,
    pub offset: u32,
}

impl Position {
    pub const fn new(chunk_id: u32, offset: u32) -> Self {
        Self { chunk_id, offset }
    }

    /// Packs the position into one integer that sorts like `(chunk_id, offset)`.
    pub const fn encode(self) -> u64 {
        ((self.chunk_id as u64) << 32) | self.offset as u64
    }

    /// Inverse of [`Position::encode`].
    pub const fn decode(raw: u64) -> Self {
        Self {
            chunk_id: (raw >> 32) as u32,
            offset: raw as u32,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.chunk_id, self.offset)
    }
}

impl Encode for Position {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.encode(), buf)
    }
}

impl Decode for Position {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, n) = u64::decode_from(buf)?;
        Ok((Self::decode(raw), n))
    }
}

/// Identifies a hint segment, and tags hash-tree snapshots with the newest
/// segment whose entries they fully incorporate.
///
/// Ordering is by chunk first, then split. Split ids start at 1, so
/// [`HintSegmentId::ZERO`] means "nothing incorporated yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HintSegmentId {
    pub chunk_id: u32,
    pub split_id: u32,
}

impl HintSegmentId {
    pub const ZERO: Self = Self {
        chunk_id: 0,
        split_id: 0,
    };

    pub const fn new(chunk_id: u32, split_id: u32) -> Self {
        Self { chunk_id, split_id }
    }

    /// Returns `true` if `self` orders strictly after `other`.
    pub fn is_larger(&self, other: &HintSegmentId) -> bool {
        self > other
    }

    /// Formats the `{chunk:03}.{split:03}` stem shared by segment and
    /// snapshot file names.
    pub(crate) fn file_stem(&self) -> String {
        format!("{:03}.{:03}", self.chunk_id, self.split_id)
    }

    /// Parses a file name of the form `{chunk}.{split}.{suffix}`.
    pub(crate) fn parse_file_name(name: &str, suffix: &str) -> Option<Self> {
        let stem = name.strip_suffix(suffix)?.strip_suffix('.')?;
        let (chunk, split) = stem.split_once('.')?;
        Some(Self {
            chunk_id: chunk.parse().ok()?,
            split_id: split.parse().ok()?,
        })
    }
}

impl fmt::Display for HintSegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chunk_id, self.split_id)
    }
}
