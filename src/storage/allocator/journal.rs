//! Append-only allocation journal for the disk allocator
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode `JournalRecord`)
//! - crc: u32 (4 bytes, CRC32 of length + data)
//!
//! A torn or corrupt tail stops replay; the file is truncated back to the
//! last good entry so later appends stay readable.

use super::BufferId;
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Largest record accepted on replay
const MAX_RECORD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum JournalRecord {
    Alloc { id: BufferId, field: String },
    Release { id: BufferId },
}

pub(crate) struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    entry_count: u64,
}

impl Journal {
    /// Open or create the journal, returning every intact record
    pub fn open(path: impl AsRef<Path>) -> StorageResult<(Self, Vec<JournalRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (records, valid_len) = Self::replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Truncating allocation journal {} to {} bytes",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        let journal = Self {
            writer: BufWriter::new(file),
            path,
            entry_count: records.len() as u64,
        };
        Ok((journal, records))
    }

    fn replay(path: &Path) -> StorageResult<(Vec<JournalRecord>, u64)> {
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((record, len))) => {
                    records.push(record);
                    valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "Allocation journal replay stopped at entry {}: {}",
                        records.len(),
                        e
                    );
                    break;
                }
            }
        }
        Ok((records, valid_len))
    }

    /// Read one entry, returning it with its on-disk size
    fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<(JournalRecord, u64)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(StorageError::Corruption(format!(
                "journal entry length too large: {}",
                len
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let record: JournalRecord = bincode::deserialize(&data)?;
        Ok(Some((record, 8 + len as u64)))
    }

    fn encode(record: &JournalRecord) -> StorageResult<Vec<u8>> {
        let data = bincode::serialize(record)?;
        let len = (data.len() as u32).to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len);
        hasher.update(&data);
        let crc = hasher.finalize();

        let mut entry = Vec::with_capacity(8 + data.len());
        entry.extend_from_slice(&len);
        entry.extend_from_slice(&data);
        entry.extend_from_slice(&crc.to_le_bytes());
        Ok(entry)
    }

    /// Append one record and hand it to the OS
    pub fn append(&mut self, record: &JournalRecord) -> StorageResult<()> {
        let entry = Self::encode(record)?;
        self.writer.write_all(&entry)?;
        self.writer.flush()?;
        self.entry_count += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replace the journal with a compact set of records
    ///
    /// Written to a sibling file and renamed over the old one.
    pub fn rewrite(&mut self, records: &[JournalRecord]) -> StorageResult<()> {
        self.sync()?;
        let tmp = self.path.with_extension("idx.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                out.write_all(&Self::encode(record)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entry_count = records.len() as u64;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}
