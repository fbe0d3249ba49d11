//! Common types and key-encoding helpers shared by the credential stores.

use std::ops::Range;

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use tollgate_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("signing-keys/k1"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("signing-keys/k1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    #[must_use]
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the half-open key range covering every key that starts with `prefix`.
///
/// The end bound is the shortest key greater than all keys with the prefix:
/// trailing `0xFF` bytes are dropped and the last remaining byte incremented.
/// A prefix made only of `0xFF` bytes (or empty) has no finite upper bound,
/// in which case the range ends at a key that sorts after any realistic key.
///
/// # Examples
///
/// ```
/// use tollgate_storage::types::prefix_range;
///
/// let range = prefix_range(b"tokens/");
/// assert_eq!(range.start, b"tokens/".to_vec());
/// assert_eq!(range.end, b"tokens0".to_vec());
/// ```
#[must_use]
pub fn prefix_range(prefix: &[u8]) -> Range<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return prefix.to_vec()..end;
        }
    }
    prefix.to_vec()..vec![u8::MAX; prefix.len() + 1]
}

/// Encodes an epoch-second block start as a fixed-width, order-preserving
/// hex string.
///
/// Flipping the sign bit maps `i64` ordering onto `u64` ordering, so
/// lexicographic order of the encoded keys equals numeric order of the
/// blocks, negative timestamps included.
///
/// # Examples
///
/// ```
/// use tollgate_storage::types::{decode_block, encode_block};
///
/// assert!(encode_block(-240) < encode_block(0));
/// assert!(encode_block(0) < encode_block(240));
/// assert_eq!(decode_block(&encode_block(720)), Some(720));
/// ```
#[must_use]
pub fn encode_block(block: i64) -> String {
    format!("{:016x}", (block as u64) ^ (1 << 63))
}

/// Inverse of [`encode_block`]. Returns `None` for anything it did not produce.
#[must_use]
pub fn decode_block(encoded: &str) -> Option<i64> {
    if encoded.len() != 16 {
        return None;
    }
    u64::from_str_radix(encoded, 16).ok().map(|raw| (raw ^ (1 << 63)) as i64)
}
