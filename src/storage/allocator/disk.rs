//! Memory-mapped, file-backed allocator
//!
//! Buffers are carved out of `buffers-NNNNN.dat` backing files, each
//! `file_size` bytes. When the newest file has no room a new one is added.
//! Every allocation and release is journaled to `buffers.idx`, which is
//! replayed (and compacted) on open.

use super::journal::{Journal, JournalRecord};
use super::{sort_by_sequence, AllocatorStats, BufferAllocator, BufferId, StoredBuffer};
use crate::storage::buffer::{Buffer, MappedFile, MappedRegion};
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JOURNAL_FILE: &str = "buffers.idx";

fn backing_file_name(index: u32) -> String {
    format!("buffers-{:05}.dat", index)
}

struct DiskState {
    files: Vec<Arc<MappedFile>>,
    /// Bump pointer within the newest file
    tail: u64,
    live: HashMap<BufferId, String>,
    /// Released regions ordered by length for best-fit reuse
    free: BTreeSet<(u32, BufferId)>,
    journal: Journal,
}

impl DiskState {
    fn region(&self, id: BufferId) -> StorageResult<Buffer> {
        let file = self.files.get(id.file_index as usize).ok_or_else(|| {
            StorageError::Corruption(format!("buffer {} references a missing backing file", id))
        })?;
        if id.offset + id.length as u64 > file.len() as u64 {
            return Err(StorageError::Corruption(format!(
                "buffer {} lies past the end of {}",
                id,
                file.path().display()
            )));
        }
        Ok(Buffer::new(Arc::new(MappedRegion::new(
            file.clone(),
            id.offset as usize,
            id.length as usize,
        ))))
    }
}

/// Allocator over memory-mapped backing files in one directory
pub struct DiskAllocator {
    dir: PathBuf,
    file_size: u64,
    state: Mutex<DiskState>,
}

impl DiskAllocator {
    /// Open the allocator in `dir`, replaying the journal
    pub fn open(dir: impl AsRef<Path>, file_size: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        if file_size == 0 || file_size > u32::MAX as u64 {
            return Err(StorageError::Config(format!(
                "backing file size must be between 1 and {} bytes",
                u32::MAX
            )));
        }

        let mut files = Vec::new();
        loop {
            let path = dir.join(backing_file_name(files.len() as u32));
            if !path.exists() {
                break;
            }
            files.push(Arc::new(MappedFile::open(&path, file_size)?));
        }

        let (journal, records) = Journal::open(dir.join(JOURNAL_FILE))?;
        let mut state = DiskState {
            files,
            tail: 0,
            live: HashMap::new(),
            free: BTreeSet::new(),
            journal,
        };
        Self::apply(&mut state, records);
        Self::compact_journal(&mut state)?;

        tracing::info!(
            "Opened buffer storage at {}: {} files, {} live buffers, {} free",
            dir.display(),
            state.files.len(),
            state.live.len(),
            state.free.len()
        );

        Ok(Self {
            dir,
            file_size,
            state: Mutex::new(state),
        })
    }

    fn apply(state: &mut DiskState, records: Vec<JournalRecord>) {
        let newest = state.files.len().checked_sub(1);
        for record in records {
            match record {
                JournalRecord::Alloc { id, field } => {
                    if let Err(e) = state.region(id) {
                        tracing::warn!("Skipping journaled allocation: {}", e);
                        continue;
                    }
                    state.free.remove(&(id.length, id));
                    if Some(id.file_index as usize) == newest {
                        state.tail = state.tail.max(id.offset + id.length as u64);
                    }
                    if !field.is_empty() {
                        state.live.insert(id, field);
                    } else {
                        state.free.insert((id.length, id));
                    }
                }
                JournalRecord::Release { id } => {
                    if state.live.remove(&id).is_some() {
                        state.free.insert((id.length, id));
                    }
                }
            }
        }
    }

    /// Rewrite the journal as one record per known region
    fn compact_journal(state: &mut DiskState) -> StorageResult<()> {
        let mut live: Vec<(&BufferId, &String)> = state.live.iter().collect();
        live.sort();
        let mut records: Vec<JournalRecord> = live
            .into_iter()
            .map(|(id, field)| JournalRecord::Alloc {
                id: *id,
                field: field.clone(),
            })
            .collect();
        // A released region is recorded as an allocation with no owner
        records.extend(state.free.iter().map(|(_, id)| JournalRecord::Alloc {
            id: *id,
            field: String::new(),
        }));
        state.journal.rewrite(&records)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn add_file(&self, state: &mut DiskState) -> StorageResult<()> {
        let index = state.files.len() as u32;
        let path = self.dir.join(backing_file_name(index));
        let file = MappedFile::open(&path, self.file_size).map_err(|e| {
            StorageError::Allocation(format!("cannot create {}: {}", path.display(), e))
        })?;
        tracing::debug!("Added backing file {}", path.display());
        state.files.push(Arc::new(file));
        state.tail = 0;
        Ok(())
    }
}

impl BufferAllocator for DiskAllocator {
    fn create_buffer(&self, field_id: &str, size: usize) -> StorageResult<StoredBuffer> {
        if field_id.is_empty() {
            return Err(StorageError::Validation("field id must not be empty".into()));
        }
        if size == 0 || size as u64 > self.file_size {
            return Err(StorageError::Allocation(format!(
                "requested {} bytes, backing files hold {}",
                size, self.file_size
            )));
        }

        let mut state = self.state.lock();
        let reused = state
            .free
            .range((size as u32, BufferId::new(0, 0, 0))..)
            .next()
            .map(|(_, id)| *id);

        let id = match reused {
            Some(id) => id,
            None => {
                let newest_len = state.files.last().map(|f| f.len() as u64);
                if newest_len.map_or(true, |len| state.tail + size as u64 > len) {
                    self.add_file(&mut state)?;
                }
                BufferId::new(
                    state.files.len() as u32 - 1,
                    state.tail,
                    size as u32,
                )
            }
        };

        let buffer = state.region(id)?;
        state.journal.append(&JournalRecord::Alloc {
            id,
            field: field_id.to_string(),
        })?;

        if reused.is_some() {
            state.free.remove(&(id.length, id));
        } else {
            state.tail += size as u64;
        }
        state.live.insert(id, field_id.to_string());
        drop(state);

        buffer.write_at(0, &vec![0u8; buffer.capacity()]);
        Ok(StoredBuffer::new(id, buffer))
    }

    fn list_buffers_for_field(&self, field_id: &str) -> StorageResult<Vec<StoredBuffer>> {
        let state = self.state.lock();
        let mut buffers = state
            .live
            .iter()
            .filter(|(_, field)| field.as_str() == field_id)
            .map(|(id, _)| Ok(StoredBuffer::new(*id, state.region(*id)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        drop(state);
        sort_by_sequence(&mut buffers);
        Ok(buffers)
    }

    fn list_fields(&self) -> Vec<String> {
        let state = self.state.lock();
        let fields: HashSet<&String> = state.live.values().collect();
        let mut fields: Vec<String> = fields.into_iter().cloned().collect();
        fields.sort();
        fields
    }

    fn release_buffers(&self, ids: &HashSet<BufferId>) -> StorageResult<()> {
        let mut state = self.state.lock();
        for id in ids {
            if !state.live.contains_key(id) {
                continue;
            }
            state.journal.append(&JournalRecord::Release { id: *id })?;
            state.live.remove(id);
            state.free.insert((id.length, *id));
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        for file in &state.files {
            file.flush()?;
        }
        state.journal.sync()
    }

    fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            live_buffers: state.live.len(),
            live_bytes: state.live.keys().map(|id| id.length as u64).sum(),
            free_buffers: state.free.len(),
            free_bytes: state.free.iter().map(|(len, _)| *len as u64).sum(),
            backing_files: state.files.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_buffers_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let allocator = DiskAllocator::open(dir.path(), 4096).unwrap();
            let stored = allocator.create_buffer("cpu#user#0", 256).unwrap();
            stored.buffer.put_u8(1, 3);
            stored.buffer.put_i64(6, 1234);
            allocator.flush().unwrap();
            stored.id
        };

        let allocator = DiskAllocator::open(dir.path(), 4096).unwrap();
        let listed = allocator.list_buffers_for_field("cpu#user#0").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].sequence(), 3);
        assert_eq!(listed[0].buffer.get_i64(6), 1234);
        assert_eq!(allocator.list_fields(), vec!["cpu#user#0".to_string()]);
    }

    #[test]
    fn test_released_region_is_zeroed_and_reused() {
        let dir = tempdir().unwrap();
        let allocator = DiskAllocator::open(dir.path(), 4096).unwrap();
        let a = allocator.create_buffer("f", 128).unwrap();
        a.buffer.put_i64(0, -1);

        allocator.release_buffers(&HashSet::from([a.id])).unwrap();
        assert_eq!(allocator.stats().free_buffers, 1);
        assert!(allocator.list_buffers_for_field("f").unwrap().is_empty());

        let b = allocator.create_buffer("g", 100).unwrap();
        assert_eq!(b.id, a.id);
        assert_eq!(b.buffer.get_i64(0), 0);
        assert_eq!(allocator.stats().free_buffers, 0);
    }

    #[test]
    fn test_release_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let allocator = DiskAllocator::open(dir.path(), 4096).unwrap();
            let a = allocator.create_buffer("f", 128).unwrap();
            allocator.create_buffer("f", 128).unwrap();
            allocator.release_buffers(&HashSet::from([a.id])).unwrap();
        }
        let allocator = DiskAllocator::open(dir.path(), 4096).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.live_buffers, 1);
        assert_eq!(stats.free_buffers, 1);

        // New allocations must not overlap the live buffer
        let c = allocator.create_buffer("h", 512).unwrap();
        assert_eq!(c.id.offset, 256);
    }

    #[test]
    fn test_grows_new_backing_file() {
        let dir = tempdir().unwrap();
        let allocator = DiskAllocator::open(dir.path(), 1024).unwrap();
        let a = allocator.create_buffer("f", 768).unwrap();
        let b = allocator.create_buffer("f", 768).unwrap();

        assert_eq!(a.id.file_index, 0);
        assert_eq!(b.id.file_index, 1);
        assert_eq!(b.id.offset, 0);
        assert_eq!(allocator.stats().backing_files, 2);
        assert!(dir.path().join("buffers-00001.dat").exists());
    }

    #[test]
    fn test_oversized_request_fails() {
        let dir = tempdir().unwrap();
        let allocator = DiskAllocator::open(dir.path(), 1024).unwrap();
        let err = allocator.create_buffer("f", 2048).unwrap_err();
        assert!(matches!(err, StorageError::Allocation(_)));
        assert_eq!(allocator.stats().live_buffers, 0);
    }
}
