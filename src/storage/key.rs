//! Fixed-width grouping key encoding.
//!
//! Keys are stored big-endian so that the store's byte ordering of keys
//! matches their numeric ordering, and popping the first key pops the
//! oldest time bucket.

use crate::error::{StoreError, StoreResult};

/// Encoded key width in bytes
pub const KEY_SIZE: usize = 8;

#[inline]
pub fn encode_key(key: u64) -> [u8; KEY_SIZE] {
    key.to_be_bytes()
}

/// Decode a stored key, rejecting anything not exactly `KEY_SIZE` bytes.
pub fn decode_key(bytes: &[u8]) -> StoreResult<u64> {
    let raw: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidKeyLength(bytes.len()))?;
    Ok(u64::from_be_bytes(raw))
}
