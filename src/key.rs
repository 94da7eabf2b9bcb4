//! Key descriptors and the hash functions behind them.

use std::fmt;

/// Maps raw key bytes to the 64-bit hash that indexes the hash-tree.
///
/// A plain function pointer so configurations stay `Copy` and tests can
/// swap in a degenerate hasher to force collisions.
pub type KeyHasher = fn(&[u8]) -> u64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 64-bit. The default [`KeyHasher`].
pub fn fnv1a_64(key: &[u8]) -> u64 {
    key.iter().fold(FNV_OFFSET_BASIS, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Checksum of a value body, stored next to the version in every index.
pub fn value_hash(value: &[u8]) -> u32 {
    crc32fast::hash(value)
}

/// Injective text form of a key. Valid UTF-8 passes through unchanged
/// except `\`, which doubles; every byte outside valid UTF-8 becomes
/// `\xHH`. Distinct keys therefore never share a string form.
pub fn key_string(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for chunk in key.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '\\' {
                out.push_str("\\\\");
            } else {
                out.push(c);
            }
        }
        for b in chunk.invalid() {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

/// Everything derived from a key once per operation.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub hash: u64,
    pub raw_key: Vec<u8>,
    /// Text form of the key (see [`key_string`]); the identity used by the
    /// collision table and hints.
    pub string_key: String,
    /// Keys beginning with `@` address a directory in hash space.
    pub is_path: bool,
}

impl KeyDescriptor {
    pub fn new(key: &[u8], hasher: KeyHasher) -> Self {
        Self::with_hash(key, hasher(key))
    }

    /// Builds a descriptor for a key whose hash is already known, e.g. one
    /// read back from a hint segment or a data record during GC.
    pub fn with_hash(key: &[u8], hash: u64) -> Self {
        Self {
            hash,
            raw_key: key.to_vec(),
            string_key: key_string(key),
            is_path: key.first() == Some(&b'@'),
        }
    }

    /// The hex hash prefix a path key addresses (`@` stripped), or `None`
    /// for ordinary keys.
    pub fn path_prefix(&self) -> Option<&str> {
        if self.is_path {
            self.string_key.get(1..)
        } else {
            None
        }
    }
}

impl fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDescriptor")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("key", &self.string_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn descriptor_derives_fields() {
        let ki = KeyDescriptor::new(b"user:1", fnv1a_64);
        assert_eq!(ki.hash, fnv1a_64(b"user:1"));
        assert_eq!(ki.string_key, "user:1");
        assert!(!ki.is_path);
        assert_eq!(ki.path_prefix(), None);

        let dir = KeyDescriptor::new(b"@0a", fnv1a_64);
        assert!(dir.is_path);
        assert_eq!(dir.path_prefix(), Some("0a"));
    }

    #[test]
    fn custom_hasher_is_used() {
        let ki = KeyDescriptor::new(b"anything", |_| 42);
        assert_eq!(ki.hash, 42);
    }

    #[test]
    fn invalid_utf8_bytes_are_escaped() {
        let ki = KeyDescriptor::with_hash(&[0x66, 0xff, 0x6f], 7);
        assert_eq!(ki.raw_key, vec![0x66, 0xff, 0x6f]);
        assert_eq!(ki.string_key, "f\\xffo");
    }

    #[test]
    fn distinct_keys_have_distinct_string_forms() {
        let keys: [&[u8]; 6] = [
            &[0x66, 0xff],
            &[0x66, 0xfe],
            b"f\\xff",
            b"f\\\\xff",
            "f\u{fffd}".as_bytes(),
            b"f",
        ];
        let forms: std::collections::HashSet<String> =
            keys.iter().map(|k| key_string(k)).collect();
        assert_eq!(forms.len(), keys.len());
        assert_eq!(key_string(b"plain:key"), "plain:key");
        assert_eq!(key_string(b"a\\b"), "a\\\\b");
    }

    #[test]
    fn value_hash_is_crc32() {
        assert_eq!(value_hash(b"123456789"), 0xcbf4_3926);
        assert_eq!(value_hash(b""), 0);
    }
}
