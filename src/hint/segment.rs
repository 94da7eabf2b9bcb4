//! Hint segment files.
//!
//! # On-disk layout
//!
//! ```text
//! [magic "HINT"][format u32][chunk u32][split u32][max_offset u32][count u32][header_crc u32]
//! [item]*count
//! [body_crc u32]
//! ```
//!
//! `max_offset` is the end of the data-chunk range the segment covers.
//! The header CRC covers the 24 header bytes before it; the body CRC covers
//! the encoded items. Segments are written once (temp file + rename) and
//! read through a read-only memory map.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use bloomfilter::Bloom;
use memmap2::Mmap;

use super::HintError;
use crate::encoding::{Decode, Encode, EncodingError};
use crate::position::HintSegmentId;
use crate::record::VersionedMeta;

pub const SEGMENT_SUFFIX: &str = "s";
const SEGMENT_MAGIC: &[u8; 4] = b"HINT";
const SEGMENT_FORMAT: u32 = 1;
pub(crate) const SEGMENT_HEADER_SIZE: usize = 28;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Index-only view of one data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintItem {
    pub key_hash: u64,
    pub key: String,
    pub offset: u32,
    pub meta: VersionedMeta,
}

impl Encode for HintItem {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key_hash.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.meta.version.encode_to(buf)?;
        self.meta.value_hash.encode_to(buf)
    }
}

impl Decode for HintItem {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key_hash, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (item_offset, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_hash, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key_hash,
                key,
                offset: item_offset,
                meta: VersionedMeta {
                    version,
                    value_hash,
                },
            },
            offset,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub id: HintSegmentId,
    pub max_offset: u32,
    pub count: u32,
}

impl SegmentHeader {
    fn encode_fields(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        SEGMENT_MAGIC.encode_to(buf)?;
        SEGMENT_FORMAT.encode_to(buf)?;
        self.id.chunk_id.encode_to(buf)?;
        self.id.split_id.encode_to(buf)?;
        self.max_offset.encode_to(buf)?;
        self.count.encode_to(buf)
    }

    fn parse(buf: &[u8], path: &Path) -> Result<Self, HintError> {
        let corrupt = |why: &str| HintError::Corrupt(path.to_path_buf(), why.to_string());
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(corrupt("short header"));
        }
        let (magic, _) = <[u8; 4]>::decode_from(buf)?;
        if &magic != SEGMENT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut offset = 4;
        let mut next_u32 = || -> Result<u32, HintError> {
            let (v, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            Ok(v)
        };
        let format = next_u32()?;
        let chunk = next_u32()?;
        let split = next_u32()?;
        let max_offset = next_u32()?;
        let count = next_u32()?;
        let stored_crc = next_u32()?;
        if format != SEGMENT_FORMAT {
            return Err(corrupt("unsupported format"));
        }
        if crc32fast::hash(&buf[..SEGMENT_HEADER_SIZE - 4]) != stored_crc {
            return Err(corrupt("header checksum mismatch"));
        }
        Ok(Self {
            id: HintSegmentId::new(chunk, split),
            max_offset,
            count,
        })
    }
}

pub fn segment_file_name(id: HintSegmentId) -> String {
    format!("{}.{SEGMENT_SUFFIX}", id.file_stem())
}

pub(crate) fn segment_path(home: &Path, id: HintSegmentId) -> PathBuf {
    home.join(segment_file_name(id))
}

/// Writes a complete segment atomically.
pub(crate) fn write_segment(
    home: &Path,
    id: HintSegmentId,
    max_offset: u32,
    items: &[HintItem],
) -> Result<PathBuf, HintError> {
    let header = SegmentHeader {
        id,
        max_offset,
        count: u32::try_from(items.len())
            .map_err(|_| HintError::Internal("too many hint items".into()))?,
    };
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + items.len() * 32 + 4);
    header.encode_fields(&mut buf)?;
    let header_crc = crc32fast::hash(&buf);
    header_crc.encode_to(&mut buf)?;

    for item in items {
        item.encode_to(&mut buf)?;
    }
    let body_crc = crc32fast::hash(&buf[SEGMENT_HEADER_SIZE..]);
    body_crc.encode_to(&mut buf)?;

    let path = segment_path(home, id);
    let tmp = path.with_extension(format!("{SEGMENT_SUFFIX}.tmp"));
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Reads and validates only the fixed header.
pub(crate) fn read_header(path: &Path) -> Result<SegmentHeader, HintError> {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    let mut f = File::open(path)?;
    f.read_exact(&mut buf)
        .map_err(|_| HintError::Corrupt(path.to_path_buf(), "short header".into()))?;
    SegmentHeader::parse(&buf, path)
}

/// Result of probing a segment or buffer for an exact key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintLookup {
    /// The exact `(hash, key)` was found.
    Found(HintItem),
    /// The hash is present, but only under other keys.
    OtherKey,
    Absent,
}

/// A validated, memory-mapped segment with a bloom filter over its hashes.
pub struct HintSegment {
    pub header: SegmentHeader,
    mmap: Mmap,
    bloom: Bloom<u64>,
}

impl HintSegment {
    /// Maps the file and verifies both checksums.
    pub fn open(path: &Path) -> Result<Self, HintError> {
        let file = File::open(path)?;
        // SAFETY: segments are never modified after the rename that
        // publishes them; replacements go through a new inode.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = SegmentHeader::parse(&mmap, path)?;
        if mmap.len() < SEGMENT_HEADER_SIZE + 4 {
            return Err(HintError::Corrupt(path.to_path_buf(), "missing body".into()));
        }
        let crc_at = mmap.len() - 4;
        let (stored, _) = u32::decode_from(&mmap[crc_at..])?;
        if crc32fast::hash(&mmap[SEGMENT_HEADER_SIZE..crc_at]) != stored {
            return Err(HintError::Corrupt(
                path.to_path_buf(),
                "body checksum mismatch".into(),
            ));
        }

        let mut bloom =
            Bloom::new_for_fp_rate((header.count as usize).max(1), BLOOM_FALSE_POSITIVE_RATE)
                .map_err(|e| HintError::Internal(e.to_string()))?;
        let mut decoded = 0u32;
        for_each_item(body_of(&mmap), |item| {
            bloom.set(&item.key_hash);
            decoded += 1;
        })?;
        if decoded != header.count {
            return Err(HintError::Corrupt(
                path.to_path_buf(),
                "item count mismatch".into(),
            ));
        }
        Ok(Self {
            header,
            mmap,
            bloom,
        })
    }

    pub fn id(&self) -> HintSegmentId {
        self.header.id
    }

    /// All items in write order.
    pub fn items(&self) -> Result<Vec<HintItem>, HintError> {
        let mut items = Vec::with_capacity(self.header.count as usize);
        for_each_item(body_of(&self.mmap), |item| items.push(item))?;
        Ok(items)
    }

    /// Looks up an exact key. The last matching item wins.
    pub fn find(&self, hash: u64, key: &str) -> Result<HintLookup, HintError> {
        if !self.bloom.check(&hash) {
            return Ok(HintLookup::Absent);
        }
        let mut result = HintLookup::Absent;
        for_each_item(body_of(&self.mmap), |item| {
            if item.key_hash != hash {
                return;
            }
            if item.key == key {
                result = HintLookup::Found(item);
            } else if result == HintLookup::Absent {
                result = HintLookup::OtherKey;
            }
        })?;
        Ok(result)
    }
}

fn body_of(mmap: &Mmap) -> &[u8] {
    &mmap[SEGMENT_HEADER_SIZE..mmap.len() - 4]
}

fn for_each_item(body: &[u8], mut f: impl FnMut(HintItem)) -> Result<(), HintError> {
    let mut offset = 0;
    while offset < body.len() {
        let (item, n) = HintItem::decode_from(&body[offset..])?;
        offset += n;
        f(item);
    }
    Ok(())
}
