//! Chronicle Storage Engine
//!
//! The engine owns every measurement and is the entry point for ingestion,
//! queries and maintenance:
//! - Write path: PointRecord → Measurement → Series → bucket Field → Segment
//! - Read path: pattern match → Series → Field snapshot readers → merge
//! - Maintenance: periodic compaction and retention on a Tokio interval
//!
//! The storage API itself is synchronous; only the maintenance scheduler is
//! async.

use crate::storage::allocator::AllocatorKind;
use crate::storage::codec::{CodecKind, DATA_OFFSET};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::field::FieldSettings;
use crate::storage::measurement::{Measurement, MeasurementStats};
use crate::storage::predicate::{TagFilter, ValuePredicate};
use crate::storage::recovery::RECOVERY_LOG_FILE;
use crate::storage::series::{CompactionSummary, GcSummary};
use crate::storage::types::{bucket_of, PointRecord, SeriesKey, SeriesOutput, TimeRange};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; each measurement gets a subdirectory
    pub data_dir: PathBuf,
    /// Where segment buffers live
    pub allocator: AllocatorKind,
    /// Size of each backing file of the disk allocator (default: 16MB)
    pub file_size: u64,
    /// Size of a new head segment in bytes (default: 4KB)
    ///
    /// One field (a column within one bucket) holds at most 254 segments.
    /// An append past that compacts the field inline, and fails with
    /// `Allocation` if the merge cannot free a slot, so pick a size that
    /// holds a bucket's worth of points in well under 254 segments.
    pub segment_size: usize,
    /// Bucket width in milliseconds
    pub bucket_width_ms: i64,
    /// Buckets older than this are evicted; `None` keeps everything
    pub retention_ms: Option<i64>,
    /// Codec for head segments
    pub write_codec: CodecKind,
    /// Codec compaction merges into
    pub compaction_codec: CodecKind,
    /// Headroom factor for the merge trial buffer
    pub compaction_ratio: f64,
    /// Run compaction in the background task
    pub compaction_enabled: bool,
    /// Compact every field right after opening
    pub compact_on_start: bool,
    /// Background compaction period in milliseconds
    pub compaction_interval_ms: u64,
    /// Run retention in the background task
    pub gc_enabled: bool,
    /// Background retention period in milliseconds
    pub gc_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("chronicle_data"),
            allocator: AllocatorKind::Disk,
            file_size: 16 * 1024 * 1024, // 16MB
            segment_size: 4096,
            bucket_width_ms: 4096 * 1000,
            retention_ms: Some(28 * 24 * 3600 * 1000), // 4 weeks
            write_codec: CodecKind::DeltaXor,
            compaction_codec: CodecKind::Gorilla,
            compaction_ratio: 1.2,
            compaction_enabled: true,
            compact_on_start: false,
            compaction_interval_ms: 60_000,
            gc_enabled: true,
            gc_interval_ms: 3_600_000,
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding one measurement's buffers and recovery log
    pub fn measurement_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn field_settings(&self) -> FieldSettings {
        FieldSettings {
            segment_size: self.segment_size,
            write_codec: self.write_codec,
            compaction_codec: self.compaction_codec,
            compaction_ratio: self.compaction_ratio,
            bucket_width: self.bucket_width_ms,
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> StorageResult<()> {
        let min_segment = DATA_OFFSET + self.write_codec.worst_case_pair();
        if self.segment_size < min_segment {
            return Err(StorageError::Config(format!(
                "segment_size must be at least {} bytes",
                min_segment
            )));
        }
        if self.allocator == AllocatorKind::Disk && (self.segment_size as u64) > self.file_size {
            return Err(StorageError::Config(
                "segment_size must not exceed file_size".to_string(),
            ));
        }
        if self.bucket_width_ms <= 0 {
            return Err(StorageError::Config(
                "bucket_width_ms must be positive".to_string(),
            ));
        }
        if !(self.compaction_ratio.is_finite() && self.compaction_ratio > 0.0) {
            return Err(StorageError::Config(
                "compaction_ratio must be a positive number".to_string(),
            ));
        }
        if matches!(self.retention_ms, Some(r) if r <= 0) {
            return Err(StorageError::Config(
                "retention must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Compile a user pattern, anchored at both ends; empty matches everything
pub fn compile_pattern(pattern: &str) -> StorageResult<Regex> {
    if pattern.is_empty() {
        return Ok(Regex::new(".*")?);
    }
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

#[derive(Debug, Clone, Copy)]
enum MaintenanceTask {
    Compaction,
    Gc,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceReport {
    pub compaction: CompactionSummary,
    pub gc: GcSummary,
}

/// Main storage engine
pub struct StorageEngine {
    config: StorageConfig,
    measurements: RwLock<HashMap<String, Arc<Measurement>>>,
    shutdown: AtomicBool,
}

impl StorageEngine {
    /// Open the engine, reattaching every measurement found under `data_dir`
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let engine = Self {
            config,
            measurements: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        };

        if engine.config.allocator == AllocatorKind::Disk {
            std::fs::create_dir_all(&engine.config.data_dir)?;
            engine.load_measurements()?;
        }

        if engine.config.compact_on_start {
            let summary = engine.compact_all();
            tracing::info!(
                "Startup compaction: {} fields compacted, {} segments removed",
                summary.compacted_fields,
                summary.removed_segments
            );
        }
        Ok(engine)
    }

    fn load_measurements(&self) -> StorageResult<()> {
        let mut loaded = HashMap::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if !path.is_dir() || !path.join(RECOVERY_LOG_FILE).exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.open_measurement(name) {
                Ok(measurement) => {
                    loaded.insert(name.to_string(), Arc::new(measurement));
                }
                Err(e) => tracing::warn!("Skipping measurement at {}: {}", path.display(), e),
            }
        }
        tracing::info!(
            "Opened {} measurements from {}",
            loaded.len(),
            self.config.data_dir.display()
        );
        *self.measurements.write() = loaded;
        Ok(())
    }

    fn open_measurement(&self, name: &str) -> StorageResult<Measurement> {
        let dir = self.config.measurement_dir(name);
        let dir = (self.config.allocator == AllocatorKind::Disk).then_some(dir.as_path());
        Measurement::open(
            name,
            dir,
            self.config.allocator,
            self.config.file_size,
            self.config.field_settings(),
        )
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn get_measurement(&self, name: &str) -> Option<Arc<Measurement>> {
        self.measurements.read().get(name).cloned()
    }

    fn require_measurement(&self, name: &str) -> StorageResult<Arc<Measurement>> {
        self.get_measurement(name)
            .ok_or_else(|| StorageError::NotFound(format!("measurement {}", name)))
    }

    pub fn get_or_create_measurement(&self, name: &str) -> StorageResult<Arc<Measurement>> {
        if let Some(m) = self.get_measurement(name) {
            return Ok(m);
        }
        let mut map = self.measurements.write();
        if let Some(m) = map.get(name) {
            return Ok(m.clone());
        }
        let measurement = Arc::new(self.open_measurement(name)?);
        tracing::debug!("Created measurement {}", name);
        map.insert(name.to_string(), measurement.clone());
        Ok(measurement)
    }

    fn write_point(&self, record: &PointRecord, locked: bool) -> StorageResult<()> {
        record.validate()?;
        let measurement = self.get_or_create_measurement(&record.measurement)?;
        measurement.add_point(record, locked)
    }

    /// Write a record; appends to the same series are serialised internally
    pub fn write_point_locked(&self, record: &PointRecord) -> StorageResult<()> {
        self.write_point(record, true)
    }

    /// Write a record; the caller guarantees one writer per series
    pub fn write_point_unlocked(&self, record: &PointRecord) -> StorageResult<()> {
        self.write_point(record, false)
    }

    /// Write records in order, stopping at the first failure
    pub fn write_batch(&self, records: &[PointRecord]) -> StorageResult<()> {
        for record in records {
            self.write_point_locked(record)?;
        }
        Ok(())
    }

    /// Query every (series, column) matching the patterns
    ///
    /// Patterns are regular expressions anchored at both ends; an empty
    /// pattern matches everything. `NotFound` is returned when no measurement
    /// matches, or when no series has a matching column.
    pub fn query(
        &self,
        measurement_pattern: &str,
        field_pattern: &str,
        range: TimeRange,
        tag_filter: Option<&dyn TagFilter>,
        predicate: Option<&dyn ValuePredicate>,
    ) -> StorageResult<Vec<SeriesOutput>> {
        let measurement_re = compile_pattern(measurement_pattern)?;
        let field_re = compile_pattern(field_pattern)?;

        let mut measurements: Vec<Arc<Measurement>> = self
            .measurements
            .read()
            .values()
            .filter(|m| measurement_re.is_match(m.name()))
            .cloned()
            .collect();
        if measurements.is_empty() {
            return Err(StorageError::NotFound(format!(
                "no measurement matches '{}'",
                measurement_pattern
            )));
        }
        measurements.sort_by(|a, b| a.name().cmp(b.name()));

        let mut out = Vec::new();
        for m in measurements {
            out.extend(m.query(&field_re, range, tag_filter, predicate)?);
        }
        if out.is_empty() {
            return Err(StorageError::NotFound(format!(
                "no series of '{}' has a field matching '{}'",
                measurement_pattern, field_pattern
            )));
        }
        Ok(out)
    }

    /// Names of every measurement, sorted
    pub fn measurements(&self) -> Vec<String> {
        let mut names: Vec<String> = self.measurements.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names matching an anchored pattern, sorted; blank matches all
    pub fn measurements_like(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let re = compile_pattern(pattern.trim())?;
        Ok(self
            .measurements()
            .into_iter()
            .filter(|name| re.is_match(name))
            .collect())
    }

    pub fn fields_for_measurement(&self, measurement: &str) -> StorageResult<Vec<String>> {
        Ok(self.require_measurement(measurement)?.field_names())
    }

    pub fn tag_keys(&self, measurement: &str) -> StorageResult<Vec<String>> {
        Ok(self.require_measurement(measurement)?.tag_keys())
    }

    pub fn tag_values(&self, measurement: &str, key: &str) -> StorageResult<Vec<String>> {
        Ok(self.require_measurement(measurement)?.tag_values(key))
    }

    pub fn series_keys(&self, measurement: &str) -> StorageResult<Vec<SeriesKey>> {
        Ok(self.require_measurement(measurement)?.series_keys())
    }

    fn all_measurements(&self) -> Vec<Arc<Measurement>> {
        self.measurements.read().values().cloned().collect()
    }

    /// Compact every field of every measurement
    pub fn compact_all(&self) -> CompactionSummary {
        let mut summary = CompactionSummary::default();
        for m in self.all_measurements() {
            summary.merge(m.compact());
        }
        summary
    }

    /// Oldest bucket kept at `now_ms` under the engine-wide retention
    pub fn retention_boundary(&self, now_ms: i64) -> Option<i64> {
        self.boundary_for(self.config.retention_ms, now_ms)
    }

    fn boundary_for(&self, retention_ms: Option<i64>, now_ms: i64) -> Option<i64> {
        retention_ms.map(|retention| {
            bucket_of(
                now_ms.saturating_sub(retention),
                self.config.bucket_width_ms,
            )
        })
    }

    /// Retention in force for a measurement: its override, else the default
    pub fn retention_for(&self, measurement: &str) -> StorageResult<Option<i64>> {
        let m = self.require_measurement(measurement)?;
        Ok(m.retention_ms().or(self.config.retention_ms))
    }

    /// Override retention for one measurement; `None` restores the default
    pub fn set_retention(&self, measurement: &str, retention_ms: Option<i64>) -> StorageResult<()> {
        self.require_measurement(measurement)?
            .set_retention_ms(retention_ms)
    }

    /// Evict buckets past retention as of now
    pub fn collect_garbage(&self) -> GcSummary {
        self.collect_garbage_at(chrono::Utc::now().timestamp_millis())
    }

    /// Evict buckets past retention as of `now_ms`
    pub fn collect_garbage_at(&self, now_ms: i64) -> GcSummary {
        let mut summary = GcSummary::default();
        for m in self.all_measurements() {
            let retention = m.retention_ms().or(self.config.retention_ms);
            if let Some(boundary) = self.boundary_for(retention, now_ms) {
                summary.merge(m.collect_garbage(boundary));
            }
        }
        summary
    }

    /// One compaction plus retention pass, as enabled in the config
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.config.compaction_enabled {
            report.compaction = self.compact_all();
        }
        if self.config.gc_enabled {
            report.gc = self.collect_garbage();
        }
        report
    }

    /// Delete a measurement with all its series, buffers and files
    pub fn drop_measurement(&self, name: &str) -> StorageResult<()> {
        let measurement = self
            .measurements
            .write()
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(format!("measurement {}", name)))?;
        let released = measurement.clear()?;
        if let Some(dir) = measurement.dir() {
            std::fs::remove_dir_all(dir)?;
        }
        tracing::info!("Dropped measurement {} ({} buffers released)", name, released);
        Ok(())
    }

    /// Flush every measurement's buffers and recovery log
    pub fn flush(&self) -> StorageResult<()> {
        for m in self.all_measurements() {
            m.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let mut measurements: Vec<MeasurementStats> =
            self.all_measurements().iter().map(|m| m.stats()).collect();
        measurements.sort_by(|a, b| a.name.cmp(&b.name));
        StorageStats {
            series_count: measurements.iter().map(|m| m.series).sum(),
            field_count: measurements.iter().map(|m| m.fields).sum(),
            segment_count: measurements.iter().map(|m| m.segments).sum(),
            total_points: measurements.iter().map(|m| m.points).sum(),
            storage_size_bytes: measurements.iter().map(|m| m.bytes).sum(),
            measurements,
        }
    }

    /// Start the background maintenance task
    ///
    /// Compaction and retention run on their own intervals; each pass runs on
    /// the blocking pool. The task exits after `shutdown`.
    pub fn start_background_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let compaction_period = Duration::from_millis(engine.config.compaction_interval_ms.max(1));
        let gc_period = Duration::from_millis(engine.config.gc_interval_ms.max(1));

        tokio::spawn(async move {
            let mut compaction_ticker = interval(compaction_period);
            let mut gc_ticker = interval(gc_period);
            // The first ticks complete immediately
            compaction_ticker.tick().await;
            gc_ticker.tick().await;

            loop {
                let task = tokio::select! {
                    _ = compaction_ticker.tick() => MaintenanceTask::Compaction,
                    _ = gc_ticker.tick() => MaintenanceTask::Gc,
                };
                if engine.shutdown.load(Ordering::Acquire) {
                    break;
                }
                engine.run_background(task).await;
            }

            if let Err(e) = engine.flush() {
                tracing::error!("Final flush failed: {}", e);
            }
        })
    }

    async fn run_background(self: &Arc<Self>, task: MaintenanceTask) {
        let engine = Arc::clone(self);
        let pass = tokio::task::spawn_blocking(move || {
            match task {
                MaintenanceTask::Compaction if engine.config.compaction_enabled => {
                    let summary = engine.compact_all();
                    if summary.compacted_fields > 0 || summary.failed_fields > 0 {
                        tracing::info!(
                            "Compaction: {} fields compacted, {} failed, {} segments removed",
                            summary.compacted_fields,
                            summary.failed_fields,
                            summary.removed_segments
                        );
                    }
                }
                MaintenanceTask::Gc if engine.config.gc_enabled => {
                    let summary = engine.collect_garbage();
                    if summary.evicted_buckets > 0 || summary.failed_series > 0 {
                        tracing::info!(
                            "Retention: {} buckets evicted, {} buffers released, {} series failed",
                            summary.evicted_buckets,
                            summary.released_buffers,
                            summary.failed_series
                        );
                    }
                }
                _ => {}
            }
        });

        if let Err(e) = pass.await {
            tracing::error!("Background {:?} panicked: {}", task, e);
        }
    }

    /// Stop background maintenance and flush everything
    pub fn shutdown(&self) -> StorageResult<()> {
        self.shutdown.store(true, Ordering::Release);
        self.flush()
    }
}

/// Storage statistics
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub series_count: usize,
    pub field_count: usize,
    pub segment_count: usize,
    pub total_points: u64,
    pub storage_size_bytes: u64,
    pub measurements: Vec<MeasurementStats>,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Measurements: {}, Series: {}, Fields: {}, Segments: {}, Points: {}, Size: {:.2} KB",
            self.measurements.len(),
            self.series_count,
            self.field_count,
            self.segment_count,
            self.total_points,
            self.storage_size_bytes as f64 / 1024.0
        )
    }
}
