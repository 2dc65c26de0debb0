//! Recovery log and buffer reconciliation
//!
//! Every new segment appends one line to `<measurement dir>/.md`:
//!
//! ```text
//! fieldId~isFp~bucketWidth~seqHex
//! ```
//!
//! The log only records topology. Point data lives in allocator buffers,
//! whose headers hold the authoritative sequence byte. At startup the two
//! are cross-checked and disagreements are logged and skipped.

use crate::storage::allocator::{BufferId, StoredBuffer};
use crate::storage::codec::COUNT_OFFSET;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::{SEQ_COMPACTION_PENDING, SEQ_SUPERSEDED};
use crate::storage::types::FieldId;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RECOVERY_LOG_FILE: &str = ".md";

/// One line of the recovery log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEntry {
    pub field: FieldId,
    pub fp: bool,
    pub bucket_width: i64,
    pub sequence: u8,
}

impl RecoveryEntry {
    pub fn new(field: FieldId, fp: bool, bucket_width: i64, sequence: u8) -> Self {
        Self {
            field,
            fp,
            bucket_width,
            sequence,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}~{}~{}~{:x}",
            self.field, self.fp, self.bucket_width, self.sequence
        )
    }

    pub fn parse(line: &str) -> StorageResult<Self> {
        let parts: Vec<&str> = line.split('~').collect();
        let [field, fp, width, seq] = parts.as_slice() else {
            return Err(StorageError::Corruption(format!(
                "expected 4 fields in recovery line: {}",
                line
            )));
        };
        let bad = |what: &str| StorageError::Corruption(format!("bad {} in: {}", what, line));

        let fp = fp.parse::<bool>().map_err(|_| bad("fp flag"))?;
        let bucket_width = width.parse::<i64>().map_err(|_| bad("bucket width"))?;
        let sequence = u8::from_str_radix(seq, 16).map_err(|_| bad("sequence"))?;
        Ok(Self::new(FieldId::parse(field)?, fp, bucket_width, sequence))
    }
}

/// Append-only topology log for one measurement
///
/// A log without a path (the in-memory measurement case) accepts appends and
/// forgets them.
pub struct RecoveryLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    entry_count: u64,
}

impl RecoveryLog {
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RECOVERY_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            writer: Some(BufWriter::new(file)),
            entry_count: 0,
        })
    }

    /// A log that persists nothing
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: None,
            entry_count: 0,
        }
    }

    pub fn append(&mut self, entry: &RecoveryEntry) -> StorageResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", entry.to_line())?;
            writer.flush()?;
        }
        self.entry_count += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Read every well-formed entry, ordered by sequence
    ///
    /// Malformed lines are logged and skipped. The sort is numeric and
    /// stable, so entries of equal sequence keep file order.
    pub fn read_entries(dir: &Path) -> StorageResult<Vec<RecoveryEntry>> {
        let path = dir.join(RECOVERY_LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match RecoveryEntry::parse(line.trim_end()) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping recovery log line {}: {}", number + 1, e),
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Replace the log with exactly `entries`
    pub fn rewrite(&mut self, entries: &[RecoveryEntry]) -> StorageResult<()> {
        let Some(path) = self.path.clone() else {
            self.entry_count = entries.len() as u64;
            return Ok(());
        };
        self.sync()?;

        let tmp = path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                writeln!(out, "{}", entry.to_line())?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        self.writer = Some(BufWriter::new(file));
        self.entry_count = entries.len() as u64;
        Ok(())
    }

    /// Entries appended or rewritten since open
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

/// Outcome of reconciling a field's buffers with its log entries
#[derive(Debug, Default)]
pub struct ReconciledField {
    /// Buffers to attach, in segment order
    pub attach: Vec<StoredBuffer>,
    /// Buffers to hand back to the allocator
    pub release: HashSet<BufferId>,
}

fn pair_count(buffer: &StoredBuffer) -> u64 {
    buffer.buffer.get_u32(COUNT_OFFSET) as u64
}

/// Settle an interrupted compaction, then check buffers against the log
///
/// A compaction writes its merged buffer with the pending marker, marks each
/// merged-away buffer superseded in ascending order, then renumbers the
/// merged buffer to sequence 0. Given the buffers found at startup:
///
/// - no pending buffer: any superseded buffers are leftovers of a committed
///   compaction and are released
/// - pending but nothing superseded: the swap never started; the pending
///   buffer is released
/// - pending and some superseded: the superseded buffers plus the lowest
///   unmarked buffers whose counts add up to the pending buffer's count are
///   replaced by it; if no such prefix exists the pending buffer is dropped
///
/// Attached buffers keep their header sequence; the caller renumbers them.
pub fn reconcile(
    field: &str,
    buffers: Vec<StoredBuffer>,
    logged: &[u8],
) -> ReconciledField {
    let mut out = ReconciledField::default();
    let mut pending = Vec::new();
    let mut superseded = Vec::new();
    let mut live = Vec::new();
    for buffer in buffers {
        match buffer.sequence() {
            SEQ_COMPACTION_PENDING => pending.push(buffer),
            SEQ_SUPERSEDED => superseded.push(buffer),
            _ => live.push(buffer),
        }
    }

    // More than one pending buffer cannot come from a single compaction
    while pending.len() > 1 {
        if let Some(extra) = pending.pop() {
            tracing::warn!("Field {}: releasing extra pending buffer {}", field, extra.id);
            out.release.insert(extra.id);
        }
    }

    let mut compacted = None;
    let mut restored = Vec::new();
    match pending.pop() {
        Some(p) if !superseded.is_empty() => {
            let target = pair_count(&p);
            let mut covered: u64 = superseded
                .iter()
                .map(pair_count)
                .sum();
            let mut taken = 0;
            while covered < target && taken < live.len() {
                covered += pair_count(&live[taken]);
                taken += 1;
            }
            if covered == target {
                tracing::info!(
                    "Field {}: completing interrupted compaction over {} buffers",
                    field,
                    superseded.len() + taken
                );
                out.release.extend(superseded.iter().map(|b| b.id));
                out.release.extend(live.drain(..taken).map(|b| b.id));
                compacted = Some(p);
            } else {
                tracing::warn!(
                    "Field {}: pending compaction covers {} points but candidates hold {}; discarding it",
                    field,
                    target,
                    covered
                );
                out.release.insert(p.id);
                // The marker replaced their sequence byte; they were the
                // oldest segments, so they go first without log checks
                restored = superseded;
            }
        }
        Some(p) => {
            tracing::warn!(
                "Field {}: releasing uncommitted compaction buffer {}",
                field,
                p.id
            );
            out.release.insert(p.id);
        }
        None => {
            for b in &superseded {
                tracing::debug!("Field {}: releasing superseded buffer {}", field, b.id);
            }
            out.release.extend(superseded.iter().map(|b| b.id));
        }
    }

    let max_logged = logged.iter().copied().max();
    let mut seen = HashSet::new();
    for buffer in live {
        let seq = buffer.sequence();
        if max_logged.map_or(true, |max| seq > max) {
            tracing::warn!(
                "Field {}: buffer {} has sequence {:x} beyond the recovery log; skipping",
                field,
                buffer.id,
                seq
            );
            continue;
        }
        if !seen.insert(seq) {
            tracing::warn!(
                "Field {}: duplicate sequence {:x} in buffer {}; skipping",
                field,
                seq,
                buffer.id
            );
            continue;
        }
        out.attach.push(buffer);
    }
    if let Some(p) = compacted {
        out.attach.insert(0, p);
    }
    if !restored.is_empty() {
        let rest = std::mem::replace(&mut out.attach, restored);
        out.attach.extend(rest);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::{BufferAllocator, MemoryAllocator};
    use crate::storage::codec::SEQUENCE_OFFSET;
    use crate::storage::types::SeriesKey;
    use tempfile::tempdir;

    fn entry(seq: u8) -> RecoveryEntry {
        let series = SeriesKey::new("cpu", &[]).unwrap();
        RecoveryEntry::new(FieldId::new(series, "user", -3), true, 1024, seq)
    }

    fn buffer(allocator: &MemoryAllocator, seq: u8, count: u32) -> StoredBuffer {
        let b = allocator.create_buffer("f", 64).unwrap();
        b.buffer.put_u8(SEQUENCE_OFFSET, seq);
        b.buffer.put_u32(COUNT_OFFSET, count);
        b
    }

    #[test]
    fn test_entry_line_format() {
        let e = entry(0x1a);
        assert_eq!(e.to_line(), "cpu#user#fffffffffffffffd~true~1024~1a");
        assert_eq!(RecoveryEntry::parse(&e.to_line()).unwrap(), e);
        assert!(RecoveryEntry::parse("cpu#user#0~maybe~1024~0").is_err());
        assert!(RecoveryEntry::parse("cpu#user#0~true~1024").is_err());
    }

    #[test]
    fn test_read_sorts_numerically_and_skips_garbage() {
        let dir = tempdir().unwrap();
        {
            let mut log = RecoveryLog::open(dir.path()).unwrap();
            for seq in [0x10, 0x2, 0xa] {
                log.append(&entry(seq)).unwrap();
            }
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(RECOVERY_LOG_FILE))
            .unwrap()
            .write_all(b"not a line\n")
            .unwrap();

        let entries = RecoveryLog::read_entries(dir.path()).unwrap();
        let seqs: Vec<u8> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0x2, 0xa, 0x10]);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let mut log = RecoveryLog::open(dir.path()).unwrap();
        for seq in 0..5 {
            log.append(&entry(seq)).unwrap();
        }
        log.rewrite(&[entry(0)]).unwrap();
        log.append(&entry(1)).unwrap();
        drop(log);

        let entries = RecoveryLog::read_entries(dir.path()).unwrap();
        assert_eq!(entries, vec![entry(0), entry(1)]);
    }

    #[test]
    fn test_reconcile_skips_mismatches() {
        let allocator = MemoryAllocator::new();
        let buffers = vec![
            buffer(&allocator, 0, 1),
            buffer(&allocator, 1, 1),
            buffer(&allocator, 1, 1),
            buffer(&allocator, 9, 1),
        ];
        let out = reconcile("f", buffers, &[0, 1, 2]);
        let seqs: Vec<u8> = out.attach.iter().map(|b| b.sequence()).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(out.release.is_empty());
    }

    #[test]
    fn test_reconcile_uncommitted_compaction() {
        let allocator = MemoryAllocator::new();
        let pending = buffer(&allocator, SEQ_COMPACTION_PENDING, 20);
        let buffers = vec![
            buffer(&allocator, 0, 10),
            buffer(&allocator, 1, 10),
            buffer(&allocator, 2, 3),
            pending.clone(),
        ];
        let out = reconcile("f", buffers, &[0, 1, 2]);
        assert_eq!(out.attach.len(), 3);
        assert_eq!(out.release, HashSet::from([pending.id]));
    }

    #[test]
    fn test_reconcile_half_marked_compaction_commits() {
        let allocator = MemoryAllocator::new();
        let pending = buffer(&allocator, SEQ_COMPACTION_PENDING, 20);
        let marked = buffer(&allocator, SEQ_SUPERSEDED, 10);
        let unmarked = buffer(&allocator, 1, 10);
        let head = buffer(&allocator, 2, 3);
        let buffers = vec![marked.clone(), unmarked.clone(), head.clone(), pending.clone()];

        let out = reconcile("f", buffers, &[0, 1, 2]);
        let ids: Vec<BufferId> = out.attach.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![pending.id, head.id]);
        assert_eq!(out.release, HashSet::from([marked.id, unmarked.id]));
    }

    #[test]
    fn test_reconcile_committed_leftovers_released() {
        let allocator = MemoryAllocator::new();
        let compacted = buffer(&allocator, 0, 20);
        let stale = buffer(&allocator, SEQ_SUPERSEDED, 10);
        let out = reconcile("f", vec![compacted.clone(), stale.clone()], &[0, 1]);
        assert_eq!(out.attach.len(), 1);
        assert_eq!(out.attach[0].id, compacted.id);
        assert_eq!(out.release, HashSet::from([stale.id]));
    }
}
