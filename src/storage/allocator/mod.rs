//! Buffer allocation for segments
//!
//! An allocator hands out fixed-size byte buffers keyed by the rendered
//! `FieldId` they belong to, and can list them again after a restart. Two
//! implementations:
//!
//! - **memory**: heap buffers, nothing survives the process
//! - **disk**: regions of memory-mapped backing files, with an append-only
//!   allocation journal replayed at open

pub mod disk;
mod journal;
pub mod memory;

pub use disk::DiskAllocator;
pub use memory::MemoryAllocator;

use crate::storage::buffer::Buffer;
use crate::storage::codec::SEQUENCE_OFFSET;
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Persisted handle to one allocated region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId {
    /// Backing file index
    pub file_index: u32,
    /// Byte offset within the backing file
    pub offset: u64,
    /// Region length in bytes
    pub length: u32,
}

impl BufferId {
    pub fn new(file_index: u32, offset: u64, length: u32) -> Self {
        Self {
            file_index,
            offset,
            length,
        }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}+{:x}", self.file_index, self.offset, self.length)
    }
}

/// A buffer together with the id it can be released or re-resolved by
#[derive(Debug, Clone)]
pub struct StoredBuffer {
    pub id: BufferId,
    pub buffer: Buffer,
}

impl StoredBuffer {
    pub fn new(id: BufferId, buffer: Buffer) -> Self {
        Self { id, buffer }
    }

    /// Sequence byte from the buffer header
    pub fn sequence(&self) -> u8 {
        self.buffer.get_u8(SEQUENCE_OFFSET)
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Buffers currently owned by fields
    pub live_buffers: usize,
    /// Bytes held by live buffers
    pub live_bytes: u64,
    /// Released regions waiting for reuse
    pub free_buffers: usize,
    /// Bytes held by released regions
    pub free_bytes: u64,
    /// Backing files (always zero for the memory allocator)
    pub backing_files: usize,
}

/// Source of segment buffers
///
/// Implementations serialize their own bookkeeping; callers may share one
/// allocator across every field of a measurement.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a zeroed buffer of at least `size` bytes owned by `field_id`
    fn create_buffer(&self, field_id: &str, size: usize) -> StorageResult<StoredBuffer>;

    /// Buffers owned by `field_id`, ordered by the header sequence byte
    fn list_buffers_for_field(&self, field_id: &str) -> StorageResult<Vec<StoredBuffer>>;

    /// Every field id that currently owns at least one buffer
    fn list_fields(&self) -> Vec<String>;

    /// Return regions for reuse; unknown ids are ignored
    ///
    /// Reuse is lazy: a released region is only handed out again by a later
    /// `create_buffer`, and readers holding snapshots are unaffected.
    fn release_buffers(&self, ids: &HashSet<BufferId>) -> StorageResult<()>;

    /// Push pending buffer contents and bookkeeping to durable storage
    fn flush(&self) -> StorageResult<()>;

    fn stats(&self) -> AllocatorStats;
}

/// Which allocator backs a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    Memory,
    #[default]
    Disk,
}

impl FromStr for AllocatorKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(AllocatorKind::Memory),
            "disk" | "mmap" => Ok(AllocatorKind::Disk),
            other => Err(StorageError::Config(format!("unknown allocator: {}", other))),
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorKind::Memory => write!(f, "memory"),
            AllocatorKind::Disk => write!(f, "disk"),
        }
    }
}

/// Open the allocator for one measurement directory
pub fn open_allocator(
    kind: AllocatorKind,
    dir: &Path,
    file_size: u64,
) -> StorageResult<Arc<dyn BufferAllocator>> {
    let allocator: Arc<dyn BufferAllocator> = match kind {
        AllocatorKind::Memory => Arc::new(MemoryAllocator::new()),
        AllocatorKind::Disk => Arc::new(DiskAllocator::open(dir, file_size)?),
    };
    Ok(allocator)
}

/// Order buffers the way fields replay them: by header sequence, then id
pub(crate) fn sort_by_sequence(buffers: &mut [StoredBuffer]) {
    buffers.sort_by_key(|b| (b.sequence(), b.id));
}
