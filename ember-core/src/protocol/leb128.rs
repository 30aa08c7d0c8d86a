//! Unsigned LEB128 varints, used to prefix keys with their collection id.

use bytes::{BufMut, Bytes, BytesMut};

/// Appends `value` to `dst` as an unsigned LEB128 varint.
pub fn write_u32(mut value: u32, dst: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint from the front of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends early or the value overflows 32 bits.
pub fn read_u32(src: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (index, byte) in src.iter().enumerate().take(5) {
        let bits = (byte & 0x7f) as u32;
        let shift = 7 * index as u32;
        if shift == 28 && bits > 0x0f {
            return None;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

/// Builds a collection-qualified key: the LEB128 collection id followed by the raw key.
pub fn encode_collection_key(collection_id: u32, key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 5);
    write_u32(collection_id, &mut buf);
    buf.extend_from_slice(key);
    buf.freeze()
}

/// Splits a collection-qualified key into its collection id and raw key.
pub fn split_collection_key(encoded: &[u8]) -> Option<(u32, &[u8])> {
    let (collection_id, used) = read_u32(encoded)?;
    Some((collection_id, &encoded[used..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        let cases: [(u32, &[u8]); 5] = [
            (0, &[0x00]),
            (8, &[0x08]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (0x555, &[0xd5, 0x0a]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            write_u32(value, &mut buf);
            assert_eq!(&buf[..], expected, "value {}", value);
            assert_eq!(read_u32(expected), Some((value, expected.len())));
        }
    }

    #[test]
    fn test_max_value() {
        let mut buf = BytesMut::new();
        write_u32(u32::MAX, &mut buf);
        assert_eq!(buf.len(), 5);
        assert_eq!(read_u32(&buf), Some((u32::MAX, 5)));
    }

    #[test]
    fn test_truncated_and_overflowing_input() {
        assert_eq!(read_u32(&[]), None);
        assert_eq!(read_u32(&[0x80, 0x80]), None);
        assert_eq!(read_u32(&[0xff, 0xff, 0xff, 0xff, 0x1f]), None);
    }

    #[test]
    fn test_collection_key() {
        let encoded = encode_collection_key(9, b"user::1");
        assert_eq!(encoded[0], 9);
        let (cid, key) = split_collection_key(&encoded).unwrap();
        assert_eq!(cid, 9);
        assert_eq!(key, b"user::1");
    }
}
