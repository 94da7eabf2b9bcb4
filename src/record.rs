//! Versioned payloads and data-log records.

use crate::key::value_hash;

/// Version and value checksum of a key, as kept by every index.
///
/// `version > 0` is live, `version <= 0` is a tombstone. The magnitude only
/// ever grows for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionedMeta {
    pub version: i32,
    pub value_hash: u32,
}

impl VersionedMeta {
    pub fn is_live(&self) -> bool {
        self.version > 0
    }
}

/// Record flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFlag {
    #[default]
    Plain,
    /// Value is a decimal counter maintained by `incr`.
    Incr,
    /// Flag word written by a client this engine does not interpret.
    Opaque(u32),
}

impl RecordFlag {
    const PLAIN: u32 = 0;
    const INCR: u32 = 0x100;

    pub fn to_u32(self) -> u32 {
        match self {
            RecordFlag::Plain => Self::PLAIN,
            RecordFlag::Incr => Self::INCR,
            RecordFlag::Opaque(raw) => raw,
        }
    }

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            Self::PLAIN => RecordFlag::Plain,
            Self::INCR => RecordFlag::Incr,
            other => RecordFlag::Opaque(other),
        }
    }
}

/// A value together with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub meta: VersionedMeta,
    pub timestamp: u32,
    pub flag: RecordFlag,
    pub value: Vec<u8>,
}

impl Payload {
    /// Builds a payload with the value hash computed from `value`.
    pub fn new(version: i32, flag: RecordFlag, timestamp: u32, value: Vec<u8>) -> Self {
        Self {
            meta: VersionedMeta {
                version,
                value_hash: value_hash(&value),
            },
            timestamp,
            flag,
            value,
        }
    }

    /// A payload carrying only metadata; the value is left empty.
    pub fn meta_only(meta: VersionedMeta) -> Self {
        Self {
            meta,
            ..Self::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        !self.meta.is_live()
    }
}

/// One entry of the data log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub payload: Payload,
}

/// Seconds since the Unix epoch, truncated to the record's 32-bit field.
pub(crate) fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_words_map_both_ways() {
        assert_eq!(RecordFlag::from_u32(0), RecordFlag::Plain);
        assert_eq!(RecordFlag::from_u32(0x100), RecordFlag::Incr);
        assert_eq!(RecordFlag::from_u32(7), RecordFlag::Opaque(7));
        assert_eq!(RecordFlag::Incr.to_u32(), 0x100);
        assert_eq!(RecordFlag::Opaque(7).to_u32(), 7);
    }

    #[test]
    fn liveness_follows_version_sign() {
        assert!(Payload::new(1, RecordFlag::Plain, 0, b"v".to_vec()).meta.is_live());
        assert!(Payload::new(0, RecordFlag::Plain, 0, Vec::new()).is_deleted());
        assert!(Payload::new(-4, RecordFlag::Plain, 0, Vec::new()).is_deleted());
    }

    #[test]
    fn new_payload_hashes_value() {
        let p = Payload::new(3, RecordFlag::Plain, 9, b"123456789".to_vec());
        assert_eq!(p.meta.value_hash, 0xcbf4_3926);
        assert_eq!(Payload::meta_only(p.meta).value, Vec::<u8>::new());
    }
}
