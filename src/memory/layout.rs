//! Binary layout of persisted vectors and their keys.
//!
//! Vector keys: `b'v'` + vid as u64 big-endian, so that ordered scans over
//! the backing store visit vids in ascending order.
//! Vector values: `dim` little-endian f32s.

use std::ops::Range;

/// Key prefix for vector records.
pub const VECTOR_PREFIX: u8 = b'v';
/// Key prefix for bookkeeping records.
pub const META_PREFIX: u8 = b'm';
/// Width of an encoded vector key.
pub const VECTOR_KEY_SIZE: usize = 1 + std::mem::size_of::<u64>();

pub fn vector_key(vid: u64) -> [u8; VECTOR_KEY_SIZE] {
    let mut key = [0u8; VECTOR_KEY_SIZE];
    key[0] = VECTOR_PREFIX;
    key[1..].copy_from_slice(&vid.to_be_bytes());
    key
}

/// Inverse of [`vector_key`]. `None` for anything that is not a vector key.
pub fn vid_from_key(key: &[u8]) -> Option<u64> {
    if key.len() != VECTOR_KEY_SIZE || key[0] != VECTOR_PREFIX {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[1..]);
    Some(u64::from_be_bytes(raw))
}

/// Half-open key range covering vids `[range.start, range.end)`.
pub fn vector_key_range(range: Range<u64>) -> ([u8; VECTOR_KEY_SIZE], [u8; VECTOR_KEY_SIZE]) {
    (vector_key(range.start), vector_key(range.end))
}

pub fn meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(META_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Serialize a vector to little-endian bytes.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Deserialize a vector; `None` when the byte count is not `dim * 4`.
pub fn decode_vector(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim * 4 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
