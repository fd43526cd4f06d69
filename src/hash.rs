//! Bucket hashing for the string-keyed index.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the key bytes.
///
/// The value is persisted implicitly through slot placement, so it must never
/// change between releases.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Home slot of `key` in a table of `table_len` cells (a power of two).
pub(crate) fn bucket(key: &[u8], table_len: u32) -> u32 {
    debug_assert!(table_len.is_power_of_two());
    fnv1a(key) & (table_len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn bucket_stays_in_range() {
        for len in [1u32, 2, 8, 1024] {
            for key in [&b"Luna"[..], b"Scootaloo", b"", b"\xff\x00"] {
                assert!(bucket(key, len) < len);
            }
        }
        assert_eq!(bucket(b"anything", 1), 0);
    }
}
