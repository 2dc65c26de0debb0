//! Byte-tagged delta-of-delta / XOR codec
//!
//! Each component is a tag byte followed by the smallest signed little-endian
//! integer that holds it:
//!
//! | tag | payload |
//! |-----|---------|
//! | 0   | none (component is zero) |
//! | 1   | i8  |
//! | 2   | i16 |
//! | 3   | i32 |
//! | 4   | i64 |

use crate::storage::error::{StorageError, StorageResult};

/// Tag byte plus an i64, for both components
pub const MAX_PAIR_BYTES: usize = 18;

const TAG_ZERO: u8 = 0;
const TAG_I8: u8 = 1;
const TAG_I16: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_I64: u8 = 4;

fn encode_component(value: i64, out: &mut [u8]) -> usize {
    if value == 0 {
        out[0] = TAG_ZERO;
        1
    } else if let Ok(v) = i8::try_from(value) {
        out[0] = TAG_I8;
        out[1..2].copy_from_slice(&v.to_le_bytes());
        2
    } else if let Ok(v) = i16::try_from(value) {
        out[0] = TAG_I16;
        out[1..3].copy_from_slice(&v.to_le_bytes());
        3
    } else if let Ok(v) = i32::try_from(value) {
        out[0] = TAG_I32;
        out[1..5].copy_from_slice(&v.to_le_bytes());
        5
    } else {
        out[0] = TAG_I64;
        out[1..9].copy_from_slice(&value.to_le_bytes());
        9
    }
}

fn take<'a>(bytes: &'a [u8], position: &mut usize, len: usize) -> StorageResult<&'a [u8]> {
    let end = *position + len;
    let slice = bytes.get(*position..end).ok_or_else(|| {
        StorageError::Corruption(format!(
            "pair stream truncated at byte {} (need {}, have {})",
            *position,
            len,
            bytes.len()
        ))
    })?;
    *position = end;
    Ok(slice)
}

fn decode_component(bytes: &[u8], position: &mut usize) -> StorageResult<i64> {
    let tag = take(bytes, position, 1)?[0];
    let value = match tag {
        TAG_ZERO => 0,
        TAG_I8 => i8::from_le_bytes([take(bytes, position, 1)?[0]]) as i64,
        TAG_I16 => {
            let mut b = [0u8; 2];
            b.copy_from_slice(take(bytes, position, 2)?);
            i16::from_le_bytes(b) as i64
        }
        TAG_I32 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(take(bytes, position, 4)?);
            i32::from_le_bytes(b) as i64
        }
        TAG_I64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(take(bytes, position, 8)?);
            i64::from_le_bytes(b)
        }
        other => {
            return Err(StorageError::Corruption(format!(
                "invalid width tag {} at byte {}",
                other,
                *position - 1
            )))
        }
    };
    Ok(value)
}

/// Encode one pair into `out`, returning the number of bytes used
pub fn encode_pair(dod: i64, xor: i64, out: &mut [u8; MAX_PAIR_BYTES]) -> usize {
    let n = encode_component(dod, &mut out[..]);
    n + encode_component(xor, &mut out[n..])
}

/// Decode one pair starting at `*position`, advancing it
pub fn decode_pair(bytes: &[u8], position: &mut usize) -> StorageResult<(i64, i64)> {
    let dod = decode_component(bytes, position)?;
    let xor = decode_component(bytes, position)?;
    Ok((dod, xor))
}
