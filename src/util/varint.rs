//! Variable-length integer encoding.
//!
//! Seven payload bits per byte, low group first, with the high bit set on
//! every byte except the last.

use crate::error::{NrtError, Result};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    let mut val = value;

    loop {
        let byte = (val & 0x7F) as u8;
        val >>= 7;

        if val == 0 {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}

/// Decode a u64 value, returning it and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;

    for (index, &byte) in bytes.iter().enumerate() {
        if index >= MAX_VARINT_LEN || (index == MAX_VARINT_LEN - 1 && byte > 1) {
            return Err(NrtError::corruption("varint overflows u64"));
        }

        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, index + 1));
        }
        shift += 7;
    }

    Err(NrtError::corruption("incomplete varint"))
}
