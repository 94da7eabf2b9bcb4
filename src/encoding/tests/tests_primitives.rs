//! Tests for fixed-width integers, bools, byte vectors, strings and options.

use crate::encoding::*;

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

#[test]
fn u32_is_little_endian() {
    let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
    assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
    let (decoded, consumed) = decode_from_slice::<u32>(&bytes).unwrap();
    assert_eq!(decoded, 0xDEAD_BEEF);
    assert_eq!(consumed, 4);
}

#[test]
fn i32_negative_versions_survive() {
    for v in [i32::MIN, -3, -1, 0, 1, 2, i32::MAX] {
        let bytes = encode_to_vec(&v).unwrap();
        let (decoded, consumed) = decode_from_slice::<i32>(&bytes).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, 4);
    }
}

#[test]
fn u64_truncated_buffer_is_eof() {
    let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
    assert!(
        matches!(
            err,
            EncodingError::UnexpectedEof {
                needed: 8,
                available: 3
            }
        ),
        "got {err:?}"
    );
}

// ------------------------------------------------------------------------------------------------
// bool
// ------------------------------------------------------------------------------------------------

#[test]
fn bool_rejects_other_bytes() {
    assert!(!decode_from_slice::<bool>(&[0]).unwrap().0);
    assert!(decode_from_slice::<bool>(&[1]).unwrap().0);
    let err = decode_from_slice::<bool>(&[7]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(7)));
}

// ------------------------------------------------------------------------------------------------
// Bytes and strings
// ------------------------------------------------------------------------------------------------

#[test]
fn byte_vec_has_length_prefix() {
    let bytes = encode_to_vec(&b"abc".to_vec()).unwrap();
    assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);
    let (decoded, consumed) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert_eq!(decoded, b"abc");
    assert_eq!(consumed, 7);
}

#[test]
fn string_invalid_utf8_is_rejected() {
    let mut buf = Vec::new();
    2u32.encode_to(&mut buf).unwrap();
    buf.extend_from_slice(&[0xFF, 0xFE]);
    let err = decode_from_slice::<String>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}

#[test]
fn consecutive_items_decode_with_offsets() {
    let mut buf = Vec::new();
    7u64.encode_to(&mut buf).unwrap();
    "key".to_string().encode_to(&mut buf).unwrap();
    (-5i32).encode_to(&mut buf).unwrap();

    let mut offset = 0;
    let (a, n) = u64::decode_from(&buf[offset..]).unwrap();
    offset += n;
    let (b, n) = String::decode_from(&buf[offset..]).unwrap();
    offset += n;
    let (c, n) = i32::decode_from(&buf[offset..]).unwrap();
    offset += n;

    assert_eq!((a, b.as_str(), c), (7, "key", -5));
    assert_eq!(offset, buf.len());
}

// ------------------------------------------------------------------------------------------------
// Option
// ------------------------------------------------------------------------------------------------

#[test]
fn option_tags() {
    assert_eq!(encode_to_vec(&None::<u32>).unwrap(), [0]);
    let bytes = encode_to_vec(&Some(9u32)).unwrap();
    assert_eq!(bytes, [1, 9, 0, 0, 0]);
    assert_eq!(decode_from_slice::<Option<u32>>(&bytes).unwrap().0, Some(9));

    let err = decode_from_slice::<Option<u32>>(&[2]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 2, .. }));
}
