//! Heap-backed allocator

use super::{sort_by_sequence, AllocatorStats, BufferAllocator, BufferId, StoredBuffer};
use crate::storage::buffer::Buffer;
use crate::storage::error::StorageResult;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    next_offset: u64,
    buffers: HashMap<BufferId, (String, Buffer)>,
}

/// Allocator whose buffers live only as long as the process
#[derive(Default)]
pub struct MemoryAllocator {
    inner: Mutex<Inner>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferAllocator for MemoryAllocator {
    fn create_buffer(&self, field_id: &str, size: usize) -> StorageResult<StoredBuffer> {
        let mut inner = self.inner.lock();
        let id = BufferId::new(0, inner.next_offset, size as u32);
        inner.next_offset += size as u64;

        let buffer = Buffer::scratch(size);
        inner
            .buffers
            .insert(id, (field_id.to_string(), buffer.clone()));
        Ok(StoredBuffer::new(id, buffer))
    }

    fn list_buffers_for_field(&self, field_id: &str) -> StorageResult<Vec<StoredBuffer>> {
        let inner = self.inner.lock();
        let mut buffers: Vec<StoredBuffer> = inner
            .buffers
            .iter()
            .filter(|(_, (field, _))| field == field_id)
            .map(|(id, (_, buffer))| StoredBuffer::new(*id, buffer.clone()))
            .collect();
        sort_by_sequence(&mut buffers);
        Ok(buffers)
    }

    fn list_fields(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let fields: HashSet<&String> = inner.buffers.values().map(|(field, _)| field).collect();
        let mut fields: Vec<String> = fields.into_iter().cloned().collect();
        fields.sort();
        fields
    }

    fn release_buffers(&self, ids: &HashSet<BufferId>) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.buffers.remove(id);
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock();
        AllocatorStats {
            live_buffers: inner.buffers.len(),
            live_bytes: inner.buffers.keys().map(|id| id.length as u64).sum(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_orders_by_sequence_byte() {
        let allocator = MemoryAllocator::new();
        let a = allocator.create_buffer("f", 64).unwrap();
        let b = allocator.create_buffer("f", 64).unwrap();
        allocator.create_buffer("g", 64).unwrap();
        a.buffer.put_u8(1, 2);
        b.buffer.put_u8(1, 1);

        let listed = allocator.list_buffers_for_field("f").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
        assert_eq!(allocator.list_fields(), vec!["f".to_string(), "g".to_string()]);
    }

    #[test]
    fn test_release_forgets_buffer() {
        let allocator = MemoryAllocator::new();
        let a = allocator.create_buffer("f", 64).unwrap();
        let b = allocator.create_buffer("f", 32).unwrap();
        assert_ne!(a.id, b.id);

        allocator.release_buffers(&HashSet::from([a.id])).unwrap();
        let listed = allocator.list_buffers_for_field("f").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(allocator.stats().live_bytes, 32);
    }
}
