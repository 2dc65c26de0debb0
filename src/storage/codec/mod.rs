//! Point codecs for Chronicle segments
//!
//! Both codecs share the same buffer layout and the same differential state;
//! they differ only in how a `(delta-of-delta, xor)` pair is packed.
//!
//! Layout (little-endian):
//! ```text
//! ┌────────────┬──────────────────────────────────────┐
//! │ [0]        │ codec id                             │
//! │ [1]        │ sequence index within the field      │
//! │ [2..6]     │ pair count: u32                      │
//! │ [6..14]    │ header timestamp: i64                │
//! │ [14..]     │ codec-specific pair stream           │
//! └────────────┴──────────────────────────────────────┘
//! ```
//!
//! - **delta_xor**: one tag byte per component, 8/16/32/64-bit payloads
//! - **gorilla**: bit-packed variable-length prefixes, better ratio, used
//!   by compaction by default

pub mod delta_xor;
pub mod gorilla;

use crate::storage::buffer::Buffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offset of the codec id byte
pub const CODEC_OFFSET: usize = 0;
/// Offset of the sequence index byte
pub const SEQUENCE_OFFSET: usize = 1;
/// Offset of the pair count
pub const COUNT_OFFSET: usize = 2;
/// Offset of the uncompressed header timestamp
pub const TIMESTAMP_OFFSET: usize = 6;
/// Offset where the pair stream starts
pub const DATA_OFFSET: usize = 14;

/// Supported codecs; the discriminant is the on-disk codec id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CodecKind {
    DeltaXor = 1,
    Gorilla = 2,
}

impl CodecKind {
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Largest number of bytes one encoded pair can occupy
    pub fn worst_case_pair(self) -> usize {
        match self {
            CodecKind::DeltaXor => delta_xor::MAX_PAIR_BYTES,
            CodecKind::Gorilla => gorilla::MAX_PAIR_BYTES,
        }
    }
}

impl TryFrom<u8> for CodecKind {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CodecKind::DeltaXor),
            2 => Ok(CodecKind::Gorilla),
            other => Err(StorageError::UnknownCodec(other)),
        }
    }
}

impl FromStr for CodecKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delta-xor" | "byzantine" => Ok(CodecKind::DeltaXor),
            "gorilla" => Ok(CodecKind::Gorilla),
            other => Err(StorageError::Config(format!("unknown codec: {}", other))),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::DeltaXor => write!(f, "delta-xor"),
            CodecKind::Gorilla => write!(f, "gorilla"),
        }
    }
}

/// Differential state carried from one pair to the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaState {
    pub prev_ts: i64,
    pub prev_delta: i64,
    pub prev_value: i64,
}

impl DeltaState {
    /// Start a stream at the header timestamp
    pub fn starting_at(header_ts: i64) -> Self {
        Self {
            prev_ts: header_ts,
            prev_delta: 0,
            prev_value: 0,
        }
    }

    /// Compute `(delta-of-delta, xor)` for the next point and advance
    ///
    /// Arithmetic wraps, so every i64 sequence round-trips.
    pub fn encode(&mut self, point: Point) -> (i64, i64) {
        let delta = point.timestamp.wrapping_sub(self.prev_ts);
        let dod = delta.wrapping_sub(self.prev_delta);
        let xor = self.prev_value ^ point.value;
        self.prev_ts = point.timestamp;
        self.prev_delta = delta;
        self.prev_value = point.value;
        (dod, xor)
    }

    /// Inverse of `encode`
    pub fn decode(&mut self, dod: i64, xor: i64) -> Point {
        let delta = self.prev_delta.wrapping_add(dod);
        let timestamp = self.prev_ts.wrapping_add(delta);
        let value = self.prev_value ^ xor;
        self.prev_ts = timestamp;
        self.prev_delta = delta;
        self.prev_value = value;
        Point { timestamp, value }
    }
}

/// Where the next pair goes
#[derive(Debug, Clone)]
enum Cursor {
    Bytes { position: usize },
    Bits(gorilla::BitCursor),
}

impl Cursor {
    fn new(kind: CodecKind) -> Self {
        match kind {
            CodecKind::DeltaXor => Cursor::Bytes {
                position: DATA_OFFSET,
            },
            CodecKind::Gorilla => Cursor::Bits(gorilla::BitCursor::default()),
        }
    }

    fn position(&self) -> usize {
        match self {
            Cursor::Bytes { position } => *position,
            Cursor::Bits(bits) => DATA_OFFSET + bits.byte_len(),
        }
    }
}

/// Encoder state for one segment buffer
#[derive(Debug, Clone)]
pub struct PairWriter {
    kind: CodecKind,
    state: DeltaState,
    count: u32,
    header_set: bool,
    cursor: Cursor,
}

impl PairWriter {
    /// Initialise a fresh buffer: zero count, header unset
    pub fn create(kind: CodecKind, buf: &Buffer) -> Self {
        buf.put_u8(CODEC_OFFSET, kind.id());
        buf.put_u32(COUNT_OFFSET, 0);
        Self {
            kind,
            state: DeltaState::default(),
            count: 0,
            header_set: false,
            cursor: Cursor::new(kind),
        }
    }

    /// Rebuild writer state from a buffer that already holds pairs
    pub fn restore(buf: &Buffer) -> StorageResult<Self> {
        let kind = CodecKind::try_from(buf.get_u8(CODEC_OFFSET))?;
        let count = buf.get_u32(COUNT_OFFSET);
        let mut writer = Self {
            kind,
            state: DeltaState::default(),
            count,
            header_set: count > 0,
            cursor: Cursor::new(kind),
        };
        if count == 0 {
            return Ok(writer);
        }

        let bytes = buf.to_vec(buf.capacity());
        let mut decoder = PairDecoder::new(kind, &bytes, count)?;
        while decoder.remaining > 0 {
            decoder.next_point()?;
        }
        writer.state = decoder.state;
        writer.cursor = decoder.cursor;
        Ok(writer)
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Bytes of the buffer in use, header included
    pub fn position(&self) -> usize {
        if self.header_set {
            self.cursor.position()
        } else {
            TIMESTAMP_OFFSET
        }
    }

    /// Write the uncompressed base timestamp; no-op once set
    pub fn set_header_timestamp(&mut self, buf: &Buffer, timestamp: i64) -> StorageResult<()> {
        if self.header_set {
            return Ok(());
        }
        if buf.capacity() < DATA_OFFSET {
            return Err(StorageError::Rollover);
        }
        buf.put_i64(TIMESTAMP_OFFSET, timestamp);
        self.state = DeltaState::starting_at(timestamp);
        self.header_set = true;
        Ok(())
    }

    /// The header timestamp, if one has been written
    pub fn header_timestamp(&self, buf: &Buffer) -> Option<i64> {
        self.header_set.then(|| buf.get_i64(TIMESTAMP_OFFSET))
    }

    /// Whether one more worst-case pair fits
    pub fn has_room(&self, capacity: usize) -> bool {
        let header = if self.header_set { 0 } else { DATA_OFFSET - TIMESTAMP_OFFSET };
        self.position() + header + self.kind.worst_case_pair() <= capacity
    }

    /// Encode one point; `Rollover` if the buffer cannot take a worst-case pair
    pub fn write(&mut self, buf: &Buffer, point: Point) -> StorageResult<()> {
        if !self.has_room(buf.capacity()) {
            return Err(StorageError::Rollover);
        }
        self.set_header_timestamp(buf, point.timestamp)?;

        let (dod, xor) = self.state.encode(point);
        match &mut self.cursor {
            Cursor::Bytes { position } => {
                let mut scratch = [0u8; delta_xor::MAX_PAIR_BYTES];
                let len = delta_xor::encode_pair(dod, xor, &mut scratch);
                buf.write_at(*position, &scratch[..len]);
                *position += len;
            }
            Cursor::Bits(bits) => {
                bits.write_pair(buf, DATA_OFFSET, dod, xor);
            }
        }
        self.count += 1;
        buf.put_u32(COUNT_OFFSET, self.count);
        Ok(())
    }
}

/// Sequential decoder over a byte snapshot
#[derive(Debug, Clone)]
pub struct PairDecoder<'a> {
    bytes: &'a [u8],
    state: DeltaState,
    remaining: u32,
    cursor: Cursor,
}

impl<'a> PairDecoder<'a> {
    /// `count` pairs are decoded from `bytes`, which starts at buffer offset 0
    pub fn new(kind: CodecKind, bytes: &'a [u8], count: u32) -> StorageResult<Self> {
        let state = if count > 0 {
            let raw = bytes.get(TIMESTAMP_OFFSET..DATA_OFFSET).ok_or_else(|| {
                StorageError::Corruption("segment too short for header timestamp".into())
            })?;
            let mut ts = [0u8; 8];
            ts.copy_from_slice(raw);
            DeltaState::starting_at(i64::from_le_bytes(ts))
        } else {
            DeltaState::default()
        };
        Ok(Self {
            bytes,
            state,
            remaining: count,
            cursor: Cursor::new(kind),
        })
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn next_point(&mut self) -> StorageResult<Point> {
        let (dod, xor) = match &mut self.cursor {
            Cursor::Bytes { position } => delta_xor::decode_pair(self.bytes, position)?,
            Cursor::Bits(bits) => bits.read_pair(self.bytes, DATA_OFFSET)?,
        };
        self.remaining -= 1;
        Ok(self.state.decode(dod, xor))
    }
}

/// Owning iterator over a private snapshot of a segment buffer
///
/// Decoding never touches the live buffer, so it needs no lock.
#[derive(Debug, Clone)]
pub struct PairReader {
    kind: CodecKind,
    bytes: Vec<u8>,
    count: u32,
    state: DeltaState,
    remaining: u32,
    cursor: Cursor,
    failed: bool,
}

impl PairReader {
    pub fn new(kind: CodecKind, bytes: Vec<u8>, count: u32) -> StorageResult<Self> {
        let (state, remaining, cursor) = {
            let decoder = PairDecoder::new(kind, &bytes, count)?;
            (decoder.state, decoder.remaining, decoder.cursor)
        };
        Ok(Self {
            kind,
            bytes,
            count,
            state,
            remaining,
            cursor,
            failed: false,
        })
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Total pairs in the snapshot
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Raw snapshot bytes, header included
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Iterator for PairReader {
    type Item = StorageResult<Point>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        let mut decoder = PairDecoder {
            bytes: &self.bytes,
            state: self.state,
            remaining: self.remaining,
            cursor: self.cursor.clone(),
        };
        match decoder.next_point() {
            Ok(point) => {
                self.state = decoder.state;
                self.remaining = decoder.remaining;
                self.cursor = decoder.cursor;
                Some(Ok(point))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
