//! Key to vbucket hashing.

/// Maps a raw document key (without collection prefix) to its vbucket.
///
/// Uses the CRC32 of the key, keeps bits 16..31 masked to 15 bits, and
/// reduces modulo the vbucket count. Every client and server must agree
/// on this function.
pub fn vbucket_for_key(key: &[u8], vbucket_count: u16) -> u16 {
    if vbucket_count == 0 {
        return 0;
    }
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) % vbucket_count as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vbucket_is_deterministic() {
        let first = vbucket_for_key(b"user::1", 1024);
        let second = vbucket_for_key(b"user::1", 1024);
        assert_eq!(first, second);
        assert!(first < 1024);
    }

    #[test]
    fn test_known_crc_value() {
        // crc32("123456789") = 0xcbf43926
        let expected = ((0xcbf4_3926u32 >> 16) & 0x7fff) % 1024;
        assert_eq!(vbucket_for_key(b"123456789", 1024) as u32, expected);
    }

    #[test]
    fn test_keys_spread_across_vbuckets() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            seen.insert(vbucket_for_key(format!("key-{}", i).as_bytes(), 64));
        }
        assert!(seen.len() > 48);
    }

    #[test]
    fn test_zero_count() {
        assert_eq!(vbucket_for_key(b"k", 0), 0);
    }
}
