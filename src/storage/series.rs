//! Series: one tag-set's fields, partitioned into time buckets

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::field::{Field, SegmentContext};
use crate::storage::predicate::ValuePredicate;
use crate::storage::types::{bucket_of, DataPoint, FieldId, Point, SeriesKey, TimeRange};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Result of compacting every field of a series (or more)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    /// Fields whose segments were merged
    pub compacted_fields: usize,
    /// Fields where the merge was attempted and abandoned
    pub failed_fields: usize,
    /// Segments merged away
    pub removed_segments: usize,
}

impl CompactionSummary {
    pub fn merge(&mut self, other: CompactionSummary) {
        self.compacted_fields += other.compacted_fields;
        self.failed_fields += other.failed_fields;
        self.removed_segments += other.removed_segments;
    }
}

/// Result of a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub evicted_buckets: usize,
    pub evicted_fields: usize,
    pub released_buffers: usize,
    /// Series whose buffers could not be released this pass
    pub failed_series: usize,
}

impl GcSummary {
    pub fn merge(&mut self, other: GcSummary) {
        self.evicted_buckets += other.evicted_buckets;
        self.evicted_fields += other.evicted_fields;
        self.released_buffers += other.released_buffers;
        self.failed_series += other.failed_series;
    }
}

type Bucket = HashMap<String, Arc<Field>>;

pub struct Series {
    key: SeriesKey,
    buckets: RwLock<BTreeMap<i64, Bucket>>,
    /// Value type each column was created with
    fp: RwLock<HashMap<String, bool>>,
    /// Serialises appends on the locked ingestion path
    write_lock: Mutex<()>,
}

impl Series {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            buckets: RwLock::new(BTreeMap::new()),
            fp: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Attach a recovered field
    pub fn insert_field(&self, field: Arc<Field>) -> StorageResult<()> {
        let column = field.id().column.clone();
        self.check_fp(&column, field.is_fp())?;
        self.buckets
            .write()
            .entry(field.id().bucket)
            .or_default()
            .insert(column, field);
        Ok(())
    }

    fn check_fp(&self, column: &str, fp: bool) -> StorageResult<()> {
        if let Some(&known) = self.fp.read().get(column) {
            return if known == fp {
                Ok(())
            } else {
                Err(StorageError::FloatingPointMismatch(format!(
                    "{}#{}",
                    self.key, column
                )))
            };
        }
        let mut map = self.fp.write();
        match map.get(column) {
            Some(&known) if known != fp => Err(StorageError::FloatingPointMismatch(format!(
                "{}#{}",
                self.key, column
            ))),
            Some(_) => Ok(()),
            None => {
                map.insert(column.to_string(), fp);
                Ok(())
            }
        }
    }

    /// The field for `column` in the bucket holding `timestamp`, created if absent
    pub fn get_or_create_field(
        &self,
        column: &str,
        timestamp: i64,
        fp: bool,
        bucket_width: i64,
    ) -> StorageResult<Arc<Field>> {
        self.check_fp(column, fp)?;
        let bucket = bucket_of(timestamp, bucket_width);
        if let Some(field) = self
            .buckets
            .read()
            .get(&bucket)
            .and_then(|b| b.get(column))
        {
            return Ok(field.clone());
        }

        let mut buckets = self.buckets.write();
        let field = buckets
            .entry(bucket)
            .or_default()
            .entry(column.to_string())
            .or_insert_with(|| {
                Arc::new(Field::new(
                    FieldId::new(self.key.clone(), column, bucket),
                    fp,
                ))
            });
        Ok(field.clone())
    }

    /// Append one value; with `locked` the series write lock is held
    pub fn add_point(
        &self,
        ctx: &SegmentContext,
        column: &str,
        fp: bool,
        point: Point,
        locked: bool,
    ) -> StorageResult<()> {
        let _guard = locked.then(|| self.write_lock.lock());
        let field =
            self.get_or_create_field(column, point.timestamp, fp, ctx.settings.bucket_width)?;
        field.append(ctx, point)
    }

    /// Append several columns sharing one timestamp under a single lock hold
    pub fn add_points(
        &self,
        ctx: &SegmentContext,
        values: &[(String, bool, i64)],
        timestamp: i64,
        locked: bool,
    ) -> StorageResult<()> {
        let _guard = locked.then(|| self.write_lock.lock());
        for (column, fp, value) in values {
            let field =
                self.get_or_create_field(column, timestamp, *fp, ctx.settings.bucket_width)?;
            field.append(ctx, Point::new(timestamp, *value))?;
        }
        Ok(())
    }

    /// Column names with their value type
    pub fn columns(&self) -> Vec<(String, bool)> {
        let mut columns: Vec<(String, bool)> =
            self.fp.read().iter().map(|(c, fp)| (c.clone(), *fp)).collect();
        columns.sort();
        columns
    }

    pub fn bucket_keys(&self) -> Vec<i64> {
        self.buckets.read().keys().copied().collect()
    }

    pub fn fields(&self) -> Vec<Arc<Field>> {
        self.buckets
            .read()
            .values()
            .flat_map(|b| b.values().cloned())
            .collect()
    }

    /// Points of every matching column in `range`, time-ordered per column
    pub fn query(
        &self,
        column: &Regex,
        range: TimeRange,
        predicate: Option<&dyn ValuePredicate>,
        bucket_width: i64,
    ) -> StorageResult<Vec<(String, bool, Vec<DataPoint>)>> {
        let (first, last) = range.buckets(bucket_width);
        let mut per_column: BTreeMap<String, (bool, Vec<Arc<Field>>)> = BTreeMap::new();
        {
            let buckets = self.buckets.read();
            for (_, bucket) in buckets.range(first..=last) {
                for (name, field) in bucket {
                    if column.is_match(name) {
                        per_column
                            .entry(name.clone())
                            .or_insert_with(|| (field.is_fp(), Vec::new()))
                            .1
                            .push(field.clone());
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(per_column.len());
        for (name, (fp, fields)) in per_column {
            let mut points = Vec::new();
            for field in fields {
                points.extend(field.query(range, predicate)?);
            }
            // Stable, so equal timestamps keep write order
            points.sort_by_key(|p| p.timestamp);
            out.push((name, fp, points));
        }
        Ok(out)
    }

    /// Compact every field
    pub fn compact(&self, ctx: &SegmentContext) -> CompactionSummary {
        let mut summary = CompactionSummary::default();
        for field in self.fields() {
            match field.compact(ctx) {
                None => {}
                Some(0) => summary.failed_fields += 1,
                Some(removed) => {
                    summary.compacted_fields += 1;
                    summary.removed_segments += removed;
                }
            }
        }
        summary
    }

    /// Drop buckets strictly older than `boundary` and release their buffers
    ///
    /// Buffers an in-flight query still reads are released by a later pass.
    pub fn collect_garbage(
        &self,
        ctx: &SegmentContext,
        boundary: i64,
    ) -> StorageResult<GcSummary> {
        let evicted = {
            let mut buckets = self.buckets.write();
            let retained = buckets.split_off(&boundary);
            std::mem::replace(&mut *buckets, retained)
        };

        let mut summary = GcSummary {
            evicted_buckets: evicted.len(),
            ..Default::default()
        };
        for (bucket, fields) in evicted {
            tracing::debug!("Series {}: evicting bucket {}", self.key, bucket);
            summary.evicted_fields += fields.len();
            for field in fields.values() {
                field.evict(ctx);
            }
        }
        if summary.evicted_buckets > 0 {
            summary.released_buffers = ctx.reclaim()?;
        }
        Ok(summary)
    }

    /// Evict every bucket; returns the number of segments retired
    pub fn evict_all(&self, ctx: &SegmentContext) -> usize {
        let buckets = std::mem::take(&mut *self.buckets.write());
        buckets
            .values()
            .flat_map(|fields| fields.values())
            .map(|field| field.evict(ctx))
            .sum()
    }
}
