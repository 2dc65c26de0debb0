//! Bit-packed Gorilla-style codec
//!
//! Timestamps use variable-length delta-of-delta prefixes:
//!
//! | prefix | payload | range |
//! |--------|---------|-------|
//! | `0`    | -       | 0 |
//! | `10`   | 7 bits  | [-64, 63] |
//! | `110`  | 9 bits  | [-256, 255] |
//! | `1110` | 12 bits | [-2048, 2047] |
//! | `1111` | 64 bits | anything |
//!
//! Values are XORed with their predecessor. A zero XOR is a single `0` bit;
//! `10` reuses the previous leading/trailing-zero window; `11` opens a new
//! window with a 5-bit leading count and 6-bit length (64 stored as 0).
//!
//! Bits are written most-significant first and pairs are not byte aligned,
//! so the cursor carries a bit position across pairs.

use crate::storage::buffer::Buffer;
use crate::storage::error::{StorageError, StorageResult};

/// 4 + 64 bits of timestamp, 2 + 5 + 6 + 64 bits of value, rounded up
pub const MAX_PAIR_BYTES: usize = 19;

const MAX_LEADING: u32 = 31;

/// Position within the bit stream plus the active XOR window
#[derive(Debug, Clone, Copy, Default)]
pub struct BitCursor {
    bit_pos: usize,
    window: Option<(u32, u32)>,
}

impl BitCursor {
    /// Bytes touched so far, counting a partial trailing byte
    pub fn byte_len(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }

    /// Append one pair to the stream starting at byte `base` of `buf`
    pub fn write_pair(&mut self, buf: &Buffer, base: usize, dod: i64, xor: i64) {
        let start_byte = base + self.bit_pos / 8;
        let start_bit = self.bit_pos % 8;
        let mut sink = BitSink::new(start_bit);
        if start_bit != 0 {
            sink.seed(buf.get_u8(start_byte));
        }

        write_timestamp(&mut sink, dod);
        self.window = write_value(&mut sink, xor as u64, self.window);

        let written = sink.bits - start_bit;
        buf.write_at(start_byte, sink.bytes());
        self.bit_pos += written;
    }

    /// Read the next pair from `bytes`, where the stream starts at byte `base`
    pub fn read_pair(&mut self, bytes: &[u8], base: usize) -> StorageResult<(i64, i64)> {
        let mut source = BitSource {
            bytes,
            bit: base * 8 + self.bit_pos,
        };
        let start = source.bit;
        let dod = read_timestamp(&mut source)?;
        let (xor, window) = read_value(&mut source, self.window)?;
        self.window = window;
        self.bit_pos += source.bit - start;
        Ok((dod, xor as i64))
    }
}

/// Small scratch area that a single pair is assembled in before copying out
struct BitSink {
    scratch: [u8; 32],
    bits: usize,
}

impl BitSink {
    fn new(start_bit: usize) -> Self {
        Self {
            scratch: [0u8; 32],
            bits: start_bit,
        }
    }

    /// Keep the bits of a partially filled first byte
    fn seed(&mut self, byte: u8) {
        let keep = 0xFFu8 << (8 - self.bits);
        self.scratch[0] = byte & keep;
    }

    fn push_bit(&mut self, bit: bool) {
        if bit {
            self.scratch[self.bits / 8] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
    }

    /// Append the low `n` bits of `value`, most significant first
    fn push(&mut self, value: u64, n: u32) {
        for i in (0..n).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.scratch[..self.bits.div_ceil(8)]
    }
}

struct BitSource<'a> {
    bytes: &'a [u8],
    bit: usize,
}

impl BitSource<'_> {
    fn read_bit(&mut self) -> StorageResult<bool> {
        let byte = self.bytes.get(self.bit / 8).ok_or_else(|| {
            StorageError::Corruption(format!(
                "bit stream truncated at bit {} of {}",
                self.bit,
                self.bytes.len() * 8
            ))
        })?;
        let set = byte & (0x80 >> (self.bit % 8)) != 0;
        self.bit += 1;
        Ok(set)
    }

    fn read(&mut self, n: u32) -> StorageResult<u64> {
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }
}

fn mask(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn write_timestamp(sink: &mut BitSink, dod: i64) {
    match dod {
        0 => sink.push(0b0, 1),
        -64..=63 => {
            sink.push(0b10, 2);
            sink.push(dod as u64 & mask(7), 7);
        }
        -256..=255 => {
            sink.push(0b110, 3);
            sink.push(dod as u64 & mask(9), 9);
        }
        -2048..=2047 => {
            sink.push(0b1110, 4);
            sink.push(dod as u64 & mask(12), 12);
        }
        _ => {
            sink.push(0b1111, 4);
            sink.push(dod as u64, 64);
        }
    }
}

fn read_timestamp(source: &mut BitSource<'_>) -> StorageResult<i64> {
    let mut ones = 0;
    while ones < 4 && source.read_bit()? {
        ones += 1;
    }
    let dod = match ones {
        0 => 0,
        1 => sign_extend(source.read(7)?, 7),
        2 => sign_extend(source.read(9)?, 9),
        3 => sign_extend(source.read(12)?, 12),
        _ => source.read(64)? as i64,
    };
    Ok(dod)
}

/// Returns the window in effect after this value
fn write_value(sink: &mut BitSink, xor: u64, window: Option<(u32, u32)>) -> Option<(u32, u32)> {
    if xor == 0 {
        sink.push(0b0, 1);
        return window;
    }

    let leading = xor.leading_zeros().min(MAX_LEADING);
    let trailing = xor.trailing_zeros();

    if let Some((prev_leading, prev_trailing)) = window {
        if leading >= prev_leading && trailing >= prev_trailing {
            let len = 64 - prev_leading - prev_trailing;
            sink.push(0b10, 2);
            sink.push(xor >> prev_trailing, len);
            return window;
        }
    }

    let len = 64 - leading - trailing;
    sink.push(0b11, 2);
    sink.push(leading as u64, 5);
    sink.push((len % 64) as u64, 6);
    sink.push(xor >> trailing, len);
    Some((leading, trailing))
}

fn read_value(
    source: &mut BitSource<'_>,
    window: Option<(u32, u32)>,
) -> StorageResult<(u64, Option<(u32, u32)>)> {
    if !source.read_bit()? {
        return Ok((0, window));
    }

    if !source.read_bit()? {
        let (leading, trailing) = window.ok_or_else(|| {
            StorageError::Corruption("window reuse before any window was opened".into())
        })?;
        let len = 64 - leading - trailing;
        let meaningful = source.read(len)?;
        return Ok((meaningful << trailing, window));
    }

    let leading = source.read(5)? as u32;
    let len = match source.read(6)? as u32 {
        0 => 64,
        n => n,
    };
    if leading + len > 64 {
        return Err(StorageError::Corruption(format!(
            "xor window out of range: leading {} length {}",
            leading, len
        )));
    }
    let trailing = 64 - leading - len;
    let meaningful = source.read(len)?;
    Ok((meaningful << trailing, Some((leading, trailing))))
}
