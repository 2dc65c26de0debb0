//! Fields: the ordered segments of one column within one time bucket
//!
//! All segments but the last are read-only; the last is the head and takes
//! appends. When the head fills, a new one is allocated, logged to the
//! recovery log and the write retried. Compaction merges everything but the
//! head into a single segment, usually with a denser codec.

use crate::storage::allocator::{BufferAllocator, BufferId, StoredBuffer};
use crate::storage::buffer::Buffer;
use crate::storage::codec::{CodecKind, PairReader, PairWriter, DATA_OFFSET, SEQUENCE_OFFSET};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::predicate::ValuePredicate;
use crate::storage::recovery::{RecoveryEntry, RecoveryLog};
use crate::storage::segment::{Segment, MAX_SEQUENCE, SEQ_COMPACTION_PENDING, SEQ_SUPERSEDED};
use crate::storage::types::{DataPoint, FieldId, Point, TimeRange};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-measurement settings every field of that measurement shares
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSettings {
    /// Initial buffer size of a new head segment
    pub segment_size: usize,
    /// Codec for head segments
    pub write_codec: CodecKind,
    /// Codec compaction merges into
    pub compaction_codec: CodecKind,
    /// Headroom factor applied to the summed byte size before a merge
    pub compaction_ratio: f64,
    /// Bucket width in milliseconds
    pub bucket_width: i64,
}

impl Default for FieldSettings {
    fn default() -> Self {
        Self {
            segment_size: 4096,
            write_codec: CodecKind::DeltaXor,
            compaction_codec: CodecKind::Gorilla,
            compaction_ratio: 1.2,
            bucket_width: 4096 * 1000,
        }
    }
}

/// What a field needs from its measurement to grow
pub struct SegmentContext {
    pub allocator: Arc<dyn BufferAllocator>,
    pub log: Mutex<RecoveryLog>,
    pub settings: FieldSettings,
    /// Segments removed from their field, awaiting release
    retired: Mutex<Vec<Arc<Segment>>>,
}

impl SegmentContext {
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        log: RecoveryLog,
        settings: FieldSettings,
    ) -> Self {
        Self {
            allocator,
            log: Mutex::new(log),
            settings,
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Queue segments for release once nothing else references them
    pub fn retire(&self, segments: impl IntoIterator<Item = Arc<Segment>>) {
        self.retired.lock().extend(segments);
    }

    /// Release every retired segment no reader still holds
    ///
    /// Returns the number of buffers handed back to the allocator.
    pub fn reclaim(&self) -> StorageResult<usize> {
        let mut retired = self.retired.lock();
        // Only this list can hand out new references, so a count of one is final
        let (ready, held): (Vec<_>, Vec<_>) = retired
            .drain(..)
            .partition(|s| Arc::strong_count(s) == 1);
        *retired = held;
        if ready.is_empty() {
            return Ok(0);
        }

        let ids: HashSet<BufferId> = ready.iter().map(|s| s.id()).collect();
        if let Err(e) = self.allocator.release_buffers(&ids) {
            retired.extend(ready);
            return Err(e);
        }
        Ok(ids.len())
    }

    /// Retired segments still waiting on a reader
    pub fn pending_release(&self) -> usize {
        self.retired.lock().len()
    }
}

/// Outcome of a single field compaction
///
/// `None` when there was nothing to merge, `Some(0)` when the attempt failed
/// and nothing changed, otherwise the number of segments merged away.
pub type CompactionResult = Option<usize>;

/// Ordered segments for one column in one bucket
pub struct Field {
    id: FieldId,
    key: String,
    fp: bool,
    segments: RwLock<Vec<Arc<Segment>>>,
    compaction: Mutex<()>,
    evicted: AtomicBool,
}

impl Field {
    pub fn new(id: FieldId, fp: bool) -> Self {
        let key = id.to_string();
        Self {
            id,
            key,
            fp,
            segments: RwLock::new(Vec::new()),
            compaction: Mutex::new(()),
            evicted: AtomicBool::new(false),
        }
    }

    /// Rebuild a field from reconciled buffers, renumbering them 0..n
    pub fn load(id: FieldId, fp: bool, buffers: Vec<StoredBuffer>) -> StorageResult<Self> {
        let field = Self::new(id, fp);
        let mut segments = Vec::with_capacity(buffers.len());
        for stored in buffers {
            let buffer_id = stored.id;
            match Segment::open(stored) {
                Ok(segment) => segments.push(Arc::new(segment)),
                Err(e) => tracing::warn!(
                    "Field {}: cannot reattach buffer {}: {}",
                    field.key,
                    buffer_id,
                    e
                ),
            }
        }
        let last = segments.len().saturating_sub(1);
        for (i, segment) in segments.iter().enumerate() {
            if segment.sequence() as usize != i {
                segment.set_sequence(i as u8);
            }
            if i != last {
                segment.make_read_only();
            }
        }
        *field.segments.write() = segments;
        Ok(field)
    }

    pub fn id(&self) -> &FieldId {
        &self.id
    }

    /// Rendered field id, as the allocator and recovery log key it
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_fp(&self) -> bool {
        self.fp
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// Total points across every segment
    pub fn point_count(&self) -> u64 {
        self.segments.read().iter().map(|s| s.count() as u64).sum()
    }

    /// Bytes in use across every segment
    pub fn byte_size(&self) -> u64 {
        self.segments.read().iter().map(|s| s.position() as u64).sum()
    }

    pub fn buffer_ids(&self) -> HashSet<BufferId> {
        self.segments.read().iter().map(|s| s.id()).collect()
    }

    /// Append a point, rolling over to a new head as needed
    ///
    /// A field that has used up every sequence number is compacted inline
    /// once before the append gives up.
    pub fn append(&self, ctx: &SegmentContext, point: Point) -> StorageResult<()> {
        match self.try_append(ctx, point) {
            Err(StorageError::Allocation(_)) if self.at_sequence_limit() => {
                tracing::info!(
                    "Field {}: {} segments in use, compacting before append",
                    self.key,
                    self.segment_count()
                );
                self.compact(ctx);
                self.try_append(ctx, point)
            }
            other => other,
        }
    }

    fn at_sequence_limit(&self) -> bool {
        self.segment_count() > MAX_SEQUENCE as usize
    }

    fn try_append(&self, ctx: &SegmentContext, point: Point) -> StorageResult<()> {
        // A fresh head always has room for one pair, so two attempts suffice
        for _ in 0..2 {
            let head = self.writable_head().map_or_else(|| self.new_head(ctx), Ok)?;
            match head.write(point) {
                Ok(()) => return Ok(()),
                Err(StorageError::Rollover) | Err(StorageError::WriteRejected) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Allocation(format!(
            "field {}: a new segment of {} bytes cannot hold a single point",
            self.key, ctx.settings.segment_size
        )))
    }

    fn writable_head(&self) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .last()
            .filter(|s| !s.is_full() && !s.is_read_only())
            .cloned()
    }

    /// Allocate, log and install a new head segment
    fn new_head(&self, ctx: &SegmentContext) -> StorageResult<Arc<Segment>> {
        let mut segments = self.segments.write();
        if self.evicted.load(Ordering::Acquire) {
            return Err(StorageError::Validation(format!(
                "field {} was evicted by retention",
                self.key
            )));
        }
        if let Some(head) = segments.last() {
            // Another writer may have rolled over first
            if !head.is_full() && !head.is_read_only() {
                return Ok(head.clone());
            }
        }

        let sequence = segments.len();
        if sequence > MAX_SEQUENCE as usize {
            return Err(StorageError::Allocation(format!(
                "field {} has {} segments; compact it or raise the segment size",
                self.key, sequence
            )));
        }
        let sequence = sequence as u8;

        let stored = ctx
            .allocator
            .create_buffer(&self.key, ctx.settings.segment_size)?;
        let buffer_id = stored.id;
        let segment = Arc::new(Segment::create(
            stored,
            ctx.settings.write_codec,
            sequence,
        ));

        let entry = RecoveryEntry::new(
            self.id.clone(),
            self.fp,
            ctx.settings.bucket_width,
            sequence,
        );
        if let Err(e) = ctx.log.lock().append(&entry) {
            if let Err(release) = ctx.allocator.release_buffers(&HashSet::from([buffer_id])) {
                tracing::warn!("Field {}: cannot release unlogged buffer: {}", self.key, release);
            }
            return Err(e);
        }

        if let Some(old) = segments.last() {
            old.make_read_only();
        }
        segments.push(segment.clone());
        tracing::debug!(
            "Field {}: new segment {} (sequence {}, {} bytes)",
            self.key,
            buffer_id,
            sequence,
            ctx.settings.segment_size
        );
        Ok(segment)
    }

    /// Snapshot readers for every segment; decoding happens outside the lock
    pub fn query_readers<'a>(
        &self,
        range: TimeRange,
        predicate: Option<&'a dyn ValuePredicate>,
    ) -> StorageResult<FieldReader<'a>> {
        let readers = self
            .segments
            .read()
            .iter()
            .map(|s| s.reader())
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(FieldReader::new(readers, range, predicate, self.fp))
    }

    /// Decode every matching point
    pub fn query(
        &self,
        range: TimeRange,
        predicate: Option<&dyn ValuePredicate>,
    ) -> StorageResult<Vec<DataPoint>> {
        self.query_readers(range, predicate)?.collect()
    }

    /// Merge every segment but the head into one
    pub fn compact(&self, ctx: &SegmentContext) -> CompactionResult {
        self.compact_with(ctx, || {})
    }

    /// `compact`, running `before_swap` after the merge but before the swap
    pub(crate) fn compact_with(
        &self,
        ctx: &SegmentContext,
        before_swap: impl FnOnce(),
    ) -> CompactionResult {
        let _guard = self.compaction.lock();

        let candidates: Vec<Arc<Segment>> = {
            let segments = self.segments.read();
            if segments.len() < 2 {
                return None;
            }
            segments[..segments.len() - 1].to_vec()
        };

        let total: usize = candidates.iter().map(|s| s.position()).sum();
        if total == 0 {
            return None;
        }
        let estimate = (total as f64 * ctx.settings.compaction_ratio).ceil() as usize;

        let settings = &ctx.settings;
        let merged = match self.merge(&candidates, settings.compaction_codec, estimate) {
            Err(e) if settings.write_codec != settings.compaction_codec => {
                tracing::debug!(
                    "Field {}: {} merge does not fit ({}), retrying with {}",
                    self.key,
                    settings.compaction_codec,
                    e,
                    settings.write_codec
                );
                self.merge(&candidates, settings.write_codec, estimate)
            }
            other => other,
        };
        let (trial, written) = match merged {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(
                    "Field {}: compaction of {} segments skipped: {}",
                    self.key,
                    candidates.len(),
                    e
                );
                return Some(0);
            }
        };

        let compacted = match self.stage(ctx, &trial, written) {
            Ok(segment) => Arc::new(segment),
            Err(e) => {
                tracing::warn!("Field {}: cannot stage compacted segment: {}", self.key, e);
                return Some(0);
            }
        };

        before_swap();

        let removed_ids: HashSet<BufferId> = candidates.iter().map(|s| s.id()).collect();
        {
            let mut segments = self.segments.write();
            if self.evicted.load(Ordering::Acquire) {
                // Retention took the candidates while we merged
                drop(segments);
                compacted.set_sequence(SEQ_SUPERSEDED);
                if let Err(e) = compacted.flush() {
                    tracing::warn!("Field {}: flush of abandoned merge failed: {}", self.key, e);
                }
                ctx.retire([compacted]);
                return Some(0);
            }
            for candidate in &candidates {
                candidate.set_sequence(SEQ_SUPERSEDED);
                if let Err(e) = candidate.flush() {
                    tracing::warn!("Field {}: flush during compaction failed: {}", self.key, e);
                }
            }
            segments.retain(|s| !removed_ids.contains(&s.id()));
            segments.insert(0, compacted);
            for (i, segment) in segments.iter().enumerate() {
                segment.set_sequence(i as u8);
            }
        }

        let removed = candidates.len();
        tracing::debug!(
            "Field {}: compacted {} segments ({} bytes) into {} bytes",
            self.key,
            removed,
            total,
            written
        );
        // Readers may still hold the old segments; release waits for them
        ctx.retire(candidates);
        if let Err(e) = ctx.reclaim() {
            tracing::warn!("Field {}: releasing compacted buffers failed: {}", self.key, e);
        }
        Some(removed)
    }

    /// Detach every segment for retention, marking each superseded
    ///
    /// The segments are retired rather than released, so in-flight readers
    /// keep valid bytes. Later appends to an evicted field are rejected.
    pub fn evict(&self, ctx: &SegmentContext) -> usize {
        let segments = {
            let mut segments = self.segments.write();
            self.evicted.store(true, Ordering::Release);
            std::mem::take(&mut *segments)
        };
        for segment in &segments {
            segment.make_read_only();
            segment.set_sequence(SEQ_SUPERSEDED);
            if let Err(e) = segment.flush() {
                tracing::warn!("Field {}: flush during eviction failed: {}", self.key, e);
            }
        }
        let count = segments.len();
        ctx.retire(segments);
        count
    }

    /// Re-encode the candidates into a scratch buffer of `capacity` bytes
    fn merge(
        &self,
        candidates: &[Arc<Segment>],
        codec: CodecKind,
        capacity: usize,
    ) -> StorageResult<(Buffer, usize)> {
        let scratch = Buffer::scratch(capacity.max(DATA_OFFSET));
        let mut writer = PairWriter::create(codec, &scratch);
        for segment in candidates {
            for point in segment.reader()? {
                writer.write(&scratch, point?)?;
            }
        }
        Ok((scratch, writer.position()))
    }

    /// Copy merged bytes into an exact-size buffer marked pending
    fn stage(&self, ctx: &SegmentContext, trial: &Buffer, written: usize) -> StorageResult<Segment> {
        let stored = ctx.allocator.create_buffer(&self.key, written)?;
        stored.buffer.write_at(0, &trial.to_vec(written));
        stored.buffer.put_u8(SEQUENCE_OFFSET, SEQ_COMPACTION_PENDING);
        stored.buffer.flush()?;

        let segment = match Segment::open(stored.clone()) {
            Ok(segment) => segment,
            Err(e) => {
                ctx.allocator
                    .release_buffers(&HashSet::from([stored.id]))?;
                return Err(e);
            }
        };
        segment.make_read_only();
        Ok(segment)
    }

    /// Flush every segment buffer
    pub fn flush(&self) -> StorageResult<()> {
        for segment in self.segments.read().iter() {
            segment.flush()?;
        }
        Ok(())
    }
}

/// Lazily decodes a field's snapshot readers in segment order
pub struct FieldReader<'a> {
    readers: std::vec::IntoIter<PairReader>,
    current: Option<PairReader>,
    range: TimeRange,
    predicate: Option<&'a dyn ValuePredicate>,
    fp: bool,
}

impl<'a> FieldReader<'a> {
    fn new(
        readers: Vec<PairReader>,
        range: TimeRange,
        predicate: Option<&'a dyn ValuePredicate>,
        fp: bool,
    ) -> Self {
        Self {
            readers: readers.into_iter(),
            current: None,
            range,
            predicate,
            fp,
        }
    }
}

impl Iterator for FieldReader<'_> {
    type Item = StorageResult<DataPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                self.current = Some(self.readers.next()?);
            }
            let reader = self.current.as_mut()?;
            match reader.next() {
                None => self.current = None,
                Some(Err(e)) => {
                    self.current = None;
                    return Some(Err(e));
                }
                Some(Ok(point)) => {
                    if !self.range.contains(point.timestamp) {
                        continue;
                    }
                    let dp = DataPoint::new(point, self.fp);
                    if self.predicate.map_or(true, |p| p.test(&dp)) {
                        return Some(Ok(dp));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::{BufferAllocator, DiskAllocator, MemoryAllocator};
    use crate::storage::types::SeriesKey;
    use tempfile::tempdir;

    fn context(segment_size: usize) -> SegmentContext {
        SegmentContext::new(
            Arc::new(MemoryAllocator::new()),
            RecoveryLog::disabled(),
            FieldSettings {
                segment_size,
                bucket_width: 1024,
                ..Default::default()
            },
        )
    }

    fn field() -> Field {
        let series = SeriesKey::new("cpu", &[]).unwrap();
        Field::new(FieldId::new(series, "user", 0), true)
    }

    fn all(field: &Field) -> Vec<Point> {
        field
            .query(TimeRange::all(), None)
            .unwrap()
            .into_iter()
            .map(|dp| dp.point())
            .collect()
    }

    #[test]
    fn test_rollover_is_transparent() {
        let ctx = context(128);
        let field = field();
        let expected: Vec<Point> = (0..500)
            .map(|i| Point::from_f64(i * 7 - 100, (i as f64).sin()))
            .collect();
        for p in &expected {
            field.append(&ctx, *p).unwrap();
        }

        assert!(field.segment_count() > 1);
        assert_eq!(field.point_count(), 500);
        assert_eq!(all(&field), expected);

        let segments = field.segments();
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.sequence() as usize, i);
            assert_eq!(s.is_read_only(), i + 1 != segments.len());
        }
    }

    #[test]
    fn test_query_range_and_predicate() {
        let ctx = context(256);
        let field = field();
        for i in 0..100 {
            field.append(&ctx, Point::from_f64(i, i as f64)).unwrap();
        }
        let even = |dp: &DataPoint| dp.value() as i64 % 2 == 0;
        let points = field.query(TimeRange::new(10, 20), Some(&even)).unwrap();
        let ts: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_compaction_preserves_data() {
        let ctx = context(128);
        let field = field();
        for i in 0..400 {
            field.append(&ctx, Point::from_f64(i * 1000, 21.5)).unwrap();
        }
        let before = all(&field);
        let segments_before = field.segment_count();
        let bytes_before = field.byte_size();
        assert!(segments_before >= 3);

        let removed = field.compact(&ctx).unwrap();
        assert_eq!(removed, segments_before - 1);
        assert_eq!(field.segment_count(), 2);
        assert!(field.byte_size() <= bytes_before);
        assert_eq!(all(&field), before);

        // Released buffers are gone from the allocator
        let listed = ctx.allocator.list_buffers_for_field(field.key()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sequence(), 0);
        assert_eq!(listed[1].sequence(), 1);
    }

    #[test]
    fn test_compaction_nothing_to_do() {
        let ctx = context(4096);
        let field = field();
        assert!(field.compact(&ctx).is_none());
        field.append(&ctx, Point::new(1, 1)).unwrap();
        assert!(field.compact(&ctx).is_none());
    }

    #[test]
    fn test_compaction_failure_changes_nothing() {
        let mut ctx = context(128);
        let field = field();
        for i in 0..300 {
            field.append(&ctx, Point::new(i * 1_000_003, i * 7_777_777)).unwrap();
        }
        let before = all(&field);
        let count = field.segment_count();

        // Far too little headroom for the merged stream
        ctx.settings.compaction_ratio = 0.1;
        assert_eq!(field.compact(&ctx), Some(0));
        assert_eq!(field.segment_count(), count);
        assert_eq!(all(&field), before);
    }

    #[test]
    fn test_append_during_compaction_is_kept() {
        let ctx = context(128);
        let field = field();
        for i in 0..300 {
            field.append(&ctx, Point::new(i, i)).unwrap();
        }

        let removed = field
            .compact_with(&ctx, || {
                for i in 300..400 {
                    field.append(&ctx, Point::new(i, i)).unwrap();
                }
            })
            .unwrap();
        assert!(removed > 0);

        let expected: Vec<Point> = (0..400).map(|i| Point::new(i, i)).collect();
        assert_eq!(all(&field), expected);
        assert_eq!(field.point_count(), 400);
    }

    #[test]
    fn test_load_renumbers_and_restores() {
        let ctx = context(128);
        let field = field();
        for i in 0..200 {
            field.append(&ctx, Point::new(i, -i)).unwrap();
        }
        let expected = all(&field);

        let buffers = ctx.allocator.list_buffers_for_field(field.key()).unwrap();
        let loaded = Field::load(field.id().clone(), true, buffers).unwrap();
        assert_eq!(all(&loaded), expected);
        assert_eq!(loaded.segment_count(), field.segment_count());

        loaded.append(&ctx, Point::new(1000, 1)).unwrap();
        assert_eq!(loaded.point_count(), 201);
    }

    #[test]
    fn test_allocation_error_propagates() {
        let ctx = context(8);
        let field = field();
        let err = field.append(&ctx, Point::new(1, 1)).unwrap_err();
        assert!(matches!(err, StorageError::Allocation(_)));
    }

    #[test]
    fn test_held_segments_survive_compaction() {
        let dir = tempdir().unwrap();
        let ctx = SegmentContext::new(
            Arc::new(DiskAllocator::open(dir.path(), 64 * 1024).unwrap()),
            RecoveryLog::disabled(),
            FieldSettings {
                segment_size: 128,
                bucket_width: 1024,
                ..Default::default()
            },
        );
        let field = field();
        for i in 0..400 {
            field.append(&ctx, Point::from_f64(i * 1000, 21.5)).unwrap();
        }

        let held = field.segments();
        let expected: Vec<Point> = held[0].reader().unwrap().map(|p| p.unwrap()).collect();
        assert!(field.compact(&ctx).unwrap() > 0);
        assert!(ctx.pending_release() > 0);

        // A neighbour grows into whatever the allocator has free
        let other = Field::new(
            FieldId::new(SeriesKey::new("cpu", &[]).unwrap(), "system", 0),
            false,
        );
        for i in 0..300 {
            other.append(&ctx, Point::new(1_000_000 + i * 7, -i)).unwrap();
        }

        let still: Vec<Point> = held[0].reader().unwrap().map(|p| p.unwrap()).collect();
        assert_eq!(still, expected);

        drop(held);
        assert!(ctx.reclaim().unwrap() > 0);
        assert_eq!(ctx.pending_release(), 0);
        assert_eq!(
            ctx.allocator.list_buffers_for_field(field.key()).unwrap().len(),
            field.segment_count()
        );
    }

    #[test]
    fn test_integer_compaction_falls_back_to_write_codec() {
        let ctx = context(128);
        let field = field();
        for i in 0..3000 {
            field.append(&ctx, Point::new(i, i)).unwrap();
        }
        let before = all(&field);
        let segments_before = field.segment_count();

        let removed = field.compact(&ctx).unwrap();
        assert_eq!(removed, segments_before - 1);
        assert_eq!(field.segment_count(), 2);
        assert_eq!(all(&field), before);
    }

    #[test]
    fn test_sequence_limit_compacts_inline() {
        // One pair per segment
        let ctx = context(DATA_OFFSET + CodecKind::DeltaXor.worst_case_pair());
        let field = field();
        for i in 0..600 {
            field.append(&ctx, Point::new(i, i * 3)).unwrap();
        }
        assert!(field.segment_count() <= MAX_SEQUENCE as usize + 1);
        let expected: Vec<Point> = (0..600).map(|i| Point::new(i, i * 3)).collect();
        assert_eq!(all(&field), expected);
    }

    #[test]
    fn test_evict_defers_release_and_rejects_writes() {
        let ctx = context(128);
        let field = field();
        for i in 0..200 {
            field.append(&ctx, Point::new(i, i)).unwrap();
        }
        let count = field.segment_count();
        let held = field.segments();

        assert_eq!(field.evict(&ctx), count);
        assert_eq!(field.segment_count(), 0);
        assert_eq!(ctx.reclaim().unwrap(), 0);
        assert_eq!(ctx.pending_release(), count);
        assert!(held.iter().all(|s| s.sequence() == SEQ_SUPERSEDED));

        drop(held);
        assert_eq!(ctx.reclaim().unwrap(), count);
        assert_eq!(ctx.allocator.stats().live_buffers, 0);

        let err = field.append(&ctx, Point::new(500, 1)).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_eviction_during_compaction_wins() {
        let ctx = context(128);
        let field = field();
        for i in 0..300 {
            field.append(&ctx, Point::new(i, i)).unwrap();
        }

        let result = field.compact_with(&ctx, || {
            field.evict(&ctx);
        });
        assert_eq!(result, Some(0));
        assert_eq!(field.segment_count(), 0);

        ctx.reclaim().unwrap();
        assert_eq!(ctx.pending_release(), 0);
        assert_eq!(ctx.allocator.stats().live_buffers, 0);
    }
}
