//! Segments: one buffer plus the codec state that writes into it
//!
//! A segment owns exactly one allocator buffer. The buffer header carries the
//! codec id and a sequence byte that orders the segment within its field;
//! two sequence values are reserved as markers for an in-progress compaction.

use crate::storage::allocator::{BufferId, StoredBuffer};
use crate::storage::buffer::Buffer;
use crate::storage::codec::{CodecKind, PairReader, PairWriter, SEQUENCE_OFFSET};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Point;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Highest sequence byte a live segment may carry
pub const MAX_SEQUENCE: u8 = 0xFD;
/// Marks a segment that a committed compaction has replaced
pub const SEQ_SUPERSEDED: u8 = 0xFE;
/// Marks a compacted segment whose swap has not committed yet
pub const SEQ_COMPACTION_PENDING: u8 = 0xFF;

struct SegmentState {
    writer: PairWriter,
    read_only: bool,
}

/// One append-only compressed buffer
pub struct Segment {
    id: BufferId,
    buffer: Buffer,
    state: RwLock<SegmentState>,
    full: AtomicBool,
}

impl Segment {
    /// Initialise a fresh buffer with `kind` and `sequence`
    pub fn create(stored: StoredBuffer, kind: CodecKind, sequence: u8) -> Self {
        let writer = PairWriter::create(kind, &stored.buffer);
        stored.buffer.put_u8(SEQUENCE_OFFSET, sequence);
        Self {
            id: stored.id,
            buffer: stored.buffer,
            state: RwLock::new(SegmentState {
                writer,
                read_only: false,
            }),
            full: AtomicBool::new(false),
        }
    }

    /// Reattach a buffer that already holds an encoded stream
    pub fn open(stored: StoredBuffer) -> StorageResult<Self> {
        let writer = PairWriter::restore(&stored.buffer)?;
        Ok(Self {
            id: stored.id,
            buffer: stored.buffer,
            state: RwLock::new(SegmentState {
                writer,
                read_only: false,
            }),
            full: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn kind(&self) -> CodecKind {
        self.state.read().writer.kind()
    }

    pub fn sequence(&self) -> u8 {
        self.buffer.get_u8(SEQUENCE_OFFSET)
    }

    pub fn set_sequence(&self, sequence: u8) {
        let _state = self.state.write();
        self.buffer.put_u8(SEQUENCE_OFFSET, sequence);
    }

    /// Append one point
    ///
    /// Fails with `Rollover` (and marks the segment full) when a worst-case
    /// pair no longer fits, and with `WriteRejected` once read-only.
    pub fn write(&self, point: Point) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.read_only {
            return Err(StorageError::WriteRejected);
        }
        match state.writer.write(&self.buffer, point) {
            Err(StorageError::Rollover) => {
                self.full.store(true, Ordering::Release);
                Err(StorageError::Rollover)
            }
            other => other,
        }
    }

    pub fn set_header_timestamp(&self, timestamp: i64) -> StorageResult<()> {
        self.state
            .write()
            .writer
            .set_header_timestamp(&self.buffer, timestamp)
    }

    pub fn header_timestamp(&self) -> Option<i64> {
        self.state.read().writer.header_timestamp(&self.buffer)
    }

    /// Idempotent
    pub fn make_read_only(&self) {
        self.state.write().read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read().read_only
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn count(&self) -> u32 {
        self.state.read().writer.count()
    }

    /// Bytes in use, header included
    pub fn position(&self) -> usize {
        self.state.read().writer.position()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Snapshot reader over everything written so far
    ///
    /// The written prefix is copied under the read lock; decoding happens on
    /// the private copy.
    pub fn reader(&self) -> StorageResult<PairReader> {
        let (kind, bytes, count) = {
            let state = self.state.read();
            let position = state.writer.position();
            (
                state.writer.kind(),
                self.buffer.to_vec(position),
                state.writer.count(),
            )
        };
        PairReader::new(kind, bytes, count)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.buffer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("kind", &state.writer.kind())
            .field("sequence", &self.buffer.get_u8(SEQUENCE_OFFSET))
            .field("count", &state.writer.count())
            .field("position", &state.writer.position())
            .field("read_only", &state.read_only)
            .field("full", &self.is_full())
            .finish()
    }
}
