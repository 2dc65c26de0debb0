//! Measurements: a named set of series sharing one allocator and recovery log

use crate::index::TagIndex;
use crate::storage::allocator::{open_allocator, AllocatorKind, AllocatorStats, BufferAllocator};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::field::{Field, FieldSettings, SegmentContext};
use crate::storage::predicate::{TagFilter, ValuePredicate};
use crate::storage::recovery::{reconcile, RecoveryEntry, RecoveryLog};
use crate::storage::series::{CompactionSummary, GcSummary, Series};
use crate::storage::types::{validate_name, FieldId, PointRecord, SeriesKey, SeriesOutput, TimeRange};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-measurement settings that outlive a restart
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct MeasurementMeta {
    /// Overrides the engine-wide retention when set
    retention_ms: Option<i64>,
}

impl MeasurementMeta {
    fn load(dir: &Path) -> StorageResult<Self> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    fn save(&self, dir: &Path) -> StorageResult<()> {
        let tmp = dir.join(format!("{}.tmp", META_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(tmp, dir.join(META_FILE))?;
        Ok(())
    }
}

/// Point-in-time counters for one measurement
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeasurementStats {
    pub name: String,
    pub series: usize,
    pub fields: usize,
    pub segments: usize,
    pub points: u64,
    pub bytes: u64,
    /// Retired segments still referenced by a reader
    pub pending_release: usize,
    pub retention_ms: Option<i64>,
    pub allocator: AllocatorStats,
}

pub struct Measurement {
    name: String,
    dir: Option<PathBuf>,
    ctx: Arc<SegmentContext>,
    series: RwLock<HashMap<SeriesKey, Arc<Series>>>,
    tag_index: RwLock<TagIndex>,
    meta: RwLock<MeasurementMeta>,
}

impl Measurement {
    /// Open (or create) a measurement
    ///
    /// With a directory and the disk allocator, existing segments are
    /// reattached from the recovery log; otherwise the measurement starts
    /// empty and persists nothing.
    pub fn open(
        name: &str,
        dir: Option<&Path>,
        kind: AllocatorKind,
        file_size: u64,
        settings: FieldSettings,
    ) -> StorageResult<Self> {
        validate_name("measurement", name)?;

        let (allocator, log, entries, meta) = match (dir, kind) {
            (Some(dir), AllocatorKind::Disk) => {
                let entries = RecoveryLog::read_entries(dir)?;
                let allocator = open_allocator(kind, dir, file_size)?;
                (allocator, RecoveryLog::open(dir)?, entries, MeasurementMeta::load(dir)?)
            }
            _ => (
                open_allocator(AllocatorKind::Memory, Path::new(""), file_size)?,
                RecoveryLog::disabled(),
                Vec::new(),
                MeasurementMeta::default(),
            ),
        };

        let measurement = Self {
            name: name.to_string(),
            dir: dir
                .filter(|_| kind == AllocatorKind::Disk)
                .map(Path::to_path_buf),
            ctx: Arc::new(SegmentContext::new(allocator, log, settings)),
            series: RwLock::new(HashMap::new()),
            tag_index: RwLock::new(TagIndex::new()),
            meta: RwLock::new(meta),
        };
        if !entries.is_empty() {
            measurement.load(entries)?;
        }
        Ok(measurement)
    }

    /// Rebuild series → bucket → field from the recovery log and allocator
    fn load(&self, entries: Vec<RecoveryEntry>) -> StorageResult<()> {
        // field key → (id, fp, logged sequences); entries arrive sorted by sequence
        let mut logged: BTreeMap<String, (FieldId, bool, Vec<u8>)> = BTreeMap::new();
        for entry in entries {
            if entry.field.series.measurement() != self.name {
                tracing::warn!(
                    "Measurement {}: ignoring recovery entry for {}",
                    self.name,
                    entry.field
                );
                continue;
            }
            if entry.bucket_width != self.ctx.settings.bucket_width {
                tracing::warn!(
                    "Measurement {}: field {} was written with bucket width {} (now {})",
                    self.name,
                    entry.field,
                    entry.bucket_width,
                    self.ctx.settings.bucket_width
                );
            }
            let key = entry.field.to_string();
            let slot = logged
                .entry(key)
                .or_insert_with(|| (entry.field.clone(), entry.fp, Vec::new()));
            slot.2.push(entry.sequence);
        }

        let allocator = &self.ctx.allocator;
        let mut fields_loaded = 0;
        let mut segments_loaded = 0;
        let mut release = HashSet::new();
        let mut rewritten = Vec::new();

        for (key, (id, fp, sequences)) in &logged {
            let buffers = allocator.list_buffers_for_field(key)?;
            if buffers.is_empty() {
                tracing::warn!(
                    "Measurement {}: field {} is logged but has no buffers; skipping",
                    self.name,
                    key
                );
                continue;
            }

            let reconciled = reconcile(key, buffers, sequences);
            release.extend(reconciled.release);
            if reconciled.attach.is_empty() {
                continue;
            }

            let field = Arc::new(Field::load(id.clone(), *fp, reconciled.attach)?);
            let series = self.get_or_create_series(&id.series);
            if let Err(e) = series.insert_field(field.clone()) {
                tracing::warn!("Measurement {}: skipping field {}: {}", self.name, key, e);
                continue;
            }

            for sequence in 0..field.segment_count() {
                rewritten.push(RecoveryEntry::new(
                    id.clone(),
                    *fp,
                    self.ctx.settings.bucket_width,
                    sequence as u8,
                ));
            }
            fields_loaded += 1;
            segments_loaded += field.segment_count();
        }

        for key in allocator.list_fields() {
            if !logged.contains_key(&key) {
                tracing::warn!(
                    "Measurement {}: buffers for {} have no recovery log entry; skipping",
                    self.name,
                    key
                );
            }
        }

        if !release.is_empty() {
            allocator.release_buffers(&release)?;
        }
        rewritten.sort_by_key(|e| e.sequence);
        self.ctx.log.lock().rewrite(&rewritten)?;

        tracing::info!(
            "Loaded measurement {}: {} series, {} fields, {} segments",
            self.name,
            self.series.read().len(),
            fields_loaded,
            segments_loaded
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory backing this measurement; `None` when nothing persists
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn settings(&self) -> &FieldSettings {
        &self.ctx.settings
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.ctx.allocator
    }

    /// Retention override, if any
    pub fn retention_ms(&self) -> Option<i64> {
        self.meta.read().retention_ms
    }

    /// Set or clear the retention override, persisting it with the data
    pub fn set_retention_ms(&self, retention_ms: Option<i64>) -> StorageResult<()> {
        if matches!(retention_ms, Some(r) if r <= 0) {
            return Err(StorageError::Validation(
                "retention must be positive".to_string(),
            ));
        }
        let mut meta = self.meta.write();
        let updated = MeasurementMeta { retention_ms };
        if let Some(dir) = self.dir() {
            updated.save(dir)?;
        }
        *meta = updated;
        tracing::info!("Measurement {}: retention set to {:?} ms", self.name, retention_ms);
        Ok(())
    }

    pub fn get_or_create_series(&self, key: &SeriesKey) -> Arc<Series> {
        if let Some(series) = self.series.read().get(key) {
            return series.clone();
        }
        let mut map = self.series.write();
        map.entry(key.clone())
            .or_insert_with(|| {
                self.tag_index.write().add_series(key);
                Arc::new(Series::new(key.clone()))
            })
            .clone()
    }

    pub fn get_series(&self, key: &SeriesKey) -> Option<Arc<Series>> {
        self.series.read().get(key).cloned()
    }

    /// Append every column of a validated record
    pub fn add_point(&self, record: &PointRecord, locked: bool) -> StorageResult<()> {
        if record.measurement != self.name {
            return Err(StorageError::Validation(format!(
                "record for {} sent to measurement {}",
                record.measurement, self.name
            )));
        }
        let key = SeriesKey::new(&self.name, &record.tags)?;
        let series = self.get_or_create_series(&key);
        let values: Vec<(String, bool, i64)> = record
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.fp, f.value))
            .collect();
        series.add_points(&self.ctx, &values, record.timestamp, locked)
    }

    /// Decoded points per (series, column) matching the filters
    pub fn query(
        &self,
        field: &Regex,
        range: TimeRange,
        tag_filter: Option<&dyn TagFilter>,
        predicate: Option<&dyn ValuePredicate>,
    ) -> StorageResult<Vec<SeriesOutput>> {
        let mut series: Vec<Arc<Series>> = match tag_filter.and_then(|f| f.required_tags()) {
            Some(required) => {
                let pairs: Vec<(&str, &str)> = required
                    .iter()
                    .map(|t| (t.key.as_str(), t.value.as_str()))
                    .collect();
                let keys = self.find_series(&pairs);
                let map = self.series.read();
                keys.iter().filter_map(|k| map.get(k).cloned()).collect()
            }
            None => self.series.read().values().cloned().collect(),
        };
        series.sort_by(|a, b| a.key().cmp(b.key()));

        let mut out = Vec::new();
        for s in series {
            let tags = s.key().tags();
            if !tag_filter.map_or(true, |f| f.matches(&tags)) {
                continue;
            }
            for (column, fp, points) in
                s.query(field, range, predicate, self.ctx.settings.bucket_width)?
            {
                out.push(SeriesOutput {
                    measurement: self.name.clone(),
                    field: column,
                    tags: tags.clone(),
                    fp,
                    points,
                });
            }
        }
        Ok(out)
    }

    pub fn series_keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Distinct column names across every series
    pub fn field_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .series
            .read()
            .values()
            .flat_map(|s| s.columns().into_iter().map(|(name, _)| name))
            .collect();
        names.into_iter().collect()
    }

    pub fn tag_keys(&self) -> Vec<String> {
        self.tag_index.read().get_keys()
    }

    pub fn tag_values(&self, key: &str) -> Vec<String> {
        self.tag_index.read().get_values(key)
    }

    /// Series carrying every given tag
    pub fn find_series(&self, tags: &[(&str, &str)]) -> Vec<SeriesKey> {
        if tags.is_empty() {
            return self.series_keys();
        }
        self.tag_index.read().find_all(tags)
    }

    fn all_series(&self) -> Vec<Arc<Series>> {
        self.series.read().values().cloned().collect()
    }

    pub fn compact(&self) -> CompactionSummary {
        self.reclaim();
        let mut summary = CompactionSummary::default();
        for series in self.all_series() {
            summary.merge(series.compact(&self.ctx));
        }
        summary
    }

    /// Evict buckets older than `boundary` from every series
    ///
    /// A series whose buffers cannot be released is logged and skipped; the
    /// retired buffers are retried by the next pass.
    pub fn collect_garbage(&self, boundary: i64) -> GcSummary {
        let mut summary = GcSummary::default();
        for series in self.all_series() {
            match series.collect_garbage(&self.ctx, boundary) {
                Ok(s) => summary.merge(s),
                Err(e) => {
                    tracing::warn!(
                        "Measurement {}: retention for series {} failed: {}",
                        self.name,
                        series.key(),
                        e
                    );
                    summary.failed_series += 1;
                }
            }
        }
        if summary.evicted_buckets > 0 {
            tracing::debug!(
                "Measurement {}: evicted {} buckets below {}",
                self.name,
                summary.evicted_buckets,
                boundary
            );
        }
        summary
    }

    /// Release retired buffers no reader holds any more
    pub fn reclaim(&self) -> usize {
        match self.ctx.reclaim() {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!("Measurement {}: releasing retired buffers failed: {}", self.name, e);
                0
            }
        }
    }

    /// Remove every series and release every buffer
    ///
    /// Returns the number of buffers released right away; the rest follow as
    /// in-flight readers finish.
    pub fn clear(&self) -> StorageResult<usize> {
        let series = std::mem::take(&mut *self.series.write());
        self.tag_index.write().clear();
        let retired: usize = series.values().map(|s| s.evict_all(&self.ctx)).sum();
        let released = self.ctx.reclaim()?;
        tracing::debug!(
            "Measurement {}: cleared {} series, {} of {} buffers released",
            self.name,
            series.len(),
            released,
            retired
        );
        Ok(released)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.reclaim();
        self.ctx.allocator.flush()?;
        self.ctx.log.lock().sync()
    }

    pub fn stats(&self) -> MeasurementStats {
        let series = self.all_series();
        let mut stats = MeasurementStats {
            name: self.name.clone(),
            series: series.len(),
            pending_release: self.ctx.pending_release(),
            retention_ms: self.retention_ms(),
            allocator: self.ctx.allocator.stats(),
            ..Default::default()
        };
        for s in &series {
            for field in s.fields() {
                stats.fields += 1;
                stats.segments += field.segment_count();
                stats.points += field.point_count();
                stats.bytes += field.byte_size();
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::{BufferId, MemoryAllocator, StoredBuffer};
    use crate::storage::predicate::TagEquals;
    use crate::storage::types::Tag;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Heap allocator whose releases fail while `refuse` is set
    struct RefusingAllocator {
        inner: MemoryAllocator,
        refuse: AtomicBool,
    }

    impl BufferAllocator for RefusingAllocator {
        fn create_buffer(&self, field_id: &str, size: usize) -> StorageResult<StoredBuffer> {
            self.inner.create_buffer(field_id, size)
        }

        fn list_buffers_for_field(&self, field_id: &str) -> StorageResult<Vec<StoredBuffer>> {
            self.inner.list_buffers_for_field(field_id)
        }

        fn list_fields(&self) -> Vec<String> {
            self.inner.list_fields()
        }

        fn release_buffers(&self, ids: &HashSet<BufferId>) -> StorageResult<()> {
            if self.refuse.load(Ordering::Acquire) {
                return Err(StorageError::Allocation("release refused".to_string()));
            }
            self.inner.release_buffers(ids)
        }

        fn flush(&self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn stats(&self) -> AllocatorStats {
            self.inner.stats()
        }
    }

    fn with_allocator(allocator: Arc<dyn BufferAllocator>) -> Measurement {
        Measurement {
            name: "cpu".to_string(),
            dir: None,
            ctx: Arc::new(SegmentContext::new(allocator, RecoveryLog::disabled(), settings())),
            series: RwLock::new(HashMap::new()),
            tag_index: RwLock::new(TagIndex::new()),
            meta: RwLock::new(MeasurementMeta::default()),
        }
    }

    fn settings() -> FieldSettings {
        FieldSettings {
            segment_size: 128,
            bucket_width: 1000,
            ..Default::default()
        }
    }

    fn open(dir: &Path) -> Measurement {
        Measurement::open("cpu", Some(dir), AllocatorKind::Disk, 64 * 1024, settings()).unwrap()
    }

    fn record(host: &str, ts: i64, value: f64) -> PointRecord {
        PointRecord::new("cpu", ts).tag("host", host).float("user", value)
    }

    fn everything(m: &Measurement) -> Vec<SeriesOutput> {
        m.query(&Regex::new(".*").unwrap(), TimeRange::all(), None, None)
            .unwrap()
    }

    #[test]
    fn test_reopen_restores_series_and_points() {
        let dir = tempdir().unwrap();
        {
            let m = open(dir.path());
            for i in 0..500 {
                m.add_point(&record(if i % 2 == 0 { "a" } else { "b" }, i * 10, i as f64), true)
                    .unwrap();
            }
            m.flush().unwrap();
        }

        let m = open(dir.path());
        let result = everything(&m);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].tags, vec![Tag::new("host", "a")]);
        assert_eq!(result[0].points.len(), 250);
        assert_eq!(result[1].points[0].value(), 1.0);
        assert_eq!(m.tag_values("host"), vec!["a", "b"]);
        assert_eq!(m.field_names(), vec!["user"]);

        // Writes continue after reopen
        m.add_point(&record("a", 10_000, 9.0), true).unwrap();
        assert_eq!(everything(&m)[0].points.len(), 251);
    }

    #[test]
    fn test_reopen_after_compaction() {
        let dir = tempdir().unwrap();
        let before = {
            let m = open(dir.path());
            for i in 0..600 {
                m.add_point(&record("a", i, 0.5), true).unwrap();
            }
            let summary = m.compact();
            assert!(summary.compacted_fields > 0);
            m.flush().unwrap();
            everything(&m)
        };

        let m = open(dir.path());
        let after = everything(&m);
        assert_eq!(after[0].points, before[0].points);
        assert_eq!(m.allocator().stats().live_buffers, m.stats().segments);
    }

    #[test]
    fn test_gc_releases_buffers() {
        let dir = tempdir().unwrap();
        let m = open(dir.path());
        for ts in [100, 1100, 2100] {
            m.add_point(&record("a", ts, 1.0), true).unwrap();
        }
        let summary = m.collect_garbage(2);
        assert_eq!(summary.evicted_buckets, 2);
        assert_eq!(m.allocator().stats().free_buffers, 2);

        let result = everything(&m);
        assert_eq!(result[0].points.len(), 1);
        assert_eq!(result[0].points[0].timestamp, 2100);
    }

    #[test]
    fn test_tag_filter_and_find_series() {
        let m = Measurement::open("cpu", None, AllocatorKind::Memory, 0, settings()).unwrap();
        m.add_point(&record("a", 1, 1.0), false).unwrap();
        m.add_point(&record("b", 1, 2.0), false).unwrap();

        let only_b = |tags: &[Tag]| tags.iter().any(|t| t.value == "b");
        let result = m
            .query(&Regex::new(".*").unwrap(), TimeRange::all(), Some(&only_b), None)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].points[0].value(), 2.0);

        assert_eq!(m.find_series(&[("host", "a")]).len(), 1);
        assert_eq!(m.find_series(&[]).len(), 2);

        // Narrowed through the tag index
        let host_a = TagEquals::new(vec![Tag::new("host", "a")]);
        let result = m
            .query(&Regex::new(".*").unwrap(), TimeRange::all(), Some(&host_a), None)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].tags, vec![Tag::new("host", "a")]);

        let nobody = TagEquals::new(vec![Tag::new("host", "z")]);
        let result = m
            .query(&Regex::new(".*").unwrap(), TimeRange::all(), Some(&nobody), None)
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_rejects_foreign_record() {
        let m = Measurement::open("cpu", None, AllocatorKind::Memory, 0, settings()).unwrap();
        let err = m
            .add_point(&PointRecord::new("mem", 1).float("x", 1.0), true)
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_gc_continues_past_failed_series() {
        let allocator = Arc::new(RefusingAllocator {
            inner: MemoryAllocator::new(),
            refuse: AtomicBool::new(true),
        });
        let m = with_allocator(allocator.clone());
        for host in ["a", "b"] {
            for ts in [100, 2100] {
                m.add_point(&record(host, ts, 1.0), true).unwrap();
            }
        }

        let summary = m.collect_garbage(2);
        assert_eq!(summary.failed_series, 2);
        assert_eq!(m.stats().pending_release, 2);

        // Both series lost their old bucket despite the failures
        let result = everything(&m);
        assert_eq!(result.len(), 2);
        assert!(result
            .iter()
            .all(|s| s.points.len() == 1 && s.points[0].timestamp == 2100));

        allocator.refuse.store(false, Ordering::Release);
        assert_eq!(m.reclaim(), 2);
        assert_eq!(m.allocator().stats().live_buffers, 2);
    }

    #[test]
    fn test_retention_override_persists() {
        let dir = tempdir().unwrap();
        {
            let m = open(dir.path());
            assert_eq!(m.retention_ms(), None);
            m.set_retention_ms(Some(5_000)).unwrap();
            assert!(matches!(
                m.set_retention_ms(Some(0)),
                Err(StorageError::Validation(_))
            ));
        }

        let m = open(dir.path());
        assert_eq!(m.retention_ms(), Some(5_000));
        assert_eq!(m.stats().retention_ms, Some(5_000));
        m.set_retention_ms(None).unwrap();
        drop(m);
        assert_eq!(open(dir.path()).retention_ms(), None);
    }

    #[test]
    fn test_clear_releases_everything() {
        let dir = tempdir().unwrap();
        let m = open(dir.path());
        for i in 0..300 {
            m.add_point(&record(if i % 2 == 0 { "a" } else { "b" }, i * 10, 0.5), true)
                .unwrap();
        }
        let segments = m.stats().segments;
        assert!(segments > 2);

        assert_eq!(m.clear().unwrap(), segments);
        assert!(m.series_keys().is_empty());
        assert!(m.tag_keys().is_empty());
        assert_eq!(m.allocator().stats().live_buffers, 0);
        assert!(everything(&m).is_empty());
    }
}
