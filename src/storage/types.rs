//! Core data types for the Chronicle time-series storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Point`: A raw `(timestamp, value-bits)` pair as the codecs see it
//! - `DataPoint`: A decoded point handed back to query callers
//! - `Tag` / `SeriesKey` / `FieldId`: Series and field identity
//! - `PointRecord`: The ingestion contract
//! - `TimeRange`: A time interval for queries

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters reserved by the series key, field id and recovery log formats
const RESERVED_CHARS: &[char] = &[',', '=', '#', '~', '\n', '\r'];

/// A single encoded observation
///
/// The value is a raw 64-bit pattern; floating point values are stored as
/// their bit reinterpretation so the codecs never branch on type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Raw value bits
    pub value: i64,
}

impl Point {
    pub fn new(timestamp: i64, value: i64) -> Self {
        Self { timestamp, value }
    }

    /// Create a point from a floating point value
    pub fn from_f64(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value: value.to_bits() as i64,
        }
    }

    /// Reinterpret the value bits as a float
    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.value as u64)
    }
}

/// A decoded data point returned by queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Raw value bits
    pub raw: i64,
    /// Whether `raw` holds an IEEE-754 double
    pub fp: bool,
}

impl DataPoint {
    pub fn new(point: Point, fp: bool) -> Self {
        Self {
            timestamp: point.timestamp,
            raw: point.value,
            fp,
        }
    }

    /// Value as a float, converting integers
    pub fn value(&self) -> f64 {
        if self.fp {
            f64::from_bits(self.raw as u64)
        } else {
            self.raw as f64
        }
    }

    /// Value as an integer, truncating floats
    pub fn long_value(&self) -> i64 {
        if self.fp {
            f64::from_bits(self.raw as u64) as i64
        } else {
            self.raw
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.timestamp, self.raw)
    }
}

/// A single tag attached to a series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Reject names that would break the on-disk key formats
pub fn validate_name(kind: &str, name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::Validation(format!("{} must not be empty", kind)));
    }
    if name.contains(RESERVED_CHARS) {
        return Err(StorageError::Validation(format!(
            "{} '{}' contains a reserved character (one of , = # ~ or newline)",
            kind, name
        )));
    }
    Ok(())
}

/// Canonical identity of a series: measurement name plus sorted tag-set
///
/// Rendered as `measurement,k1=v1,k2=v2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey(String);

impl SeriesKey {
    /// Build a key, validating every component
    pub fn new(measurement: &str, tags: &[Tag]) -> StorageResult<Self> {
        validate_name("measurement", measurement)?;
        let mut sorted = tags.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut key = measurement.to_string();
        for tag in &sorted {
            validate_name("tag key", &tag.key)?;
            validate_name("tag value", &tag.value)?;
            key.push(',');
            key.push_str(&tag.key);
            key.push('=');
            key.push_str(&tag.value);
        }
        Ok(Self(key))
    }

    /// Parse a rendered key (as read back from the recovery log)
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let key = Self(raw.to_string());
        if key.measurement().is_empty() {
            return Err(StorageError::Corruption(format!("bad series key: {}", raw)));
        }
        for part in raw.split(',').skip(1) {
            if part.split_once('=').is_none() {
                return Err(StorageError::Corruption(format!("bad series key: {}", raw)));
            }
        }
        Ok(key)
    }

    pub fn measurement(&self) -> &str {
        self.0.split(',').next().unwrap_or_default()
    }

    /// Decode the tag-set, sorted by key then value
    pub fn tags(&self) -> Vec<Tag> {
        self.0
            .split(',')
            .skip(1)
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| Tag::new(k, v))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one bucketed field: (series, column, bucket)
///
/// Rendered as `series#column#bucketHex`; the bucket is printed as the
/// two's complement hex of the i64 so negative buckets survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    pub series: SeriesKey,
    pub column: String,
    pub bucket: i64,
}

impl FieldId {
    pub fn new(series: SeriesKey, column: impl Into<String>, bucket: i64) -> Self {
        Self {
            series,
            column: column.into(),
            bucket,
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let mut parts = raw.rsplitn(3, '#');
        let bucket = parts.next();
        let column = parts.next();
        let series = parts.next();
        match (series, column, bucket) {
            (Some(series), Some(column), Some(bucket)) if !column.is_empty() => {
                let bucket = u64::from_str_radix(bucket, 16).map_err(|e| {
                    StorageError::Corruption(format!("bad bucket in field id {}: {}", raw, e))
                })? as i64;
                Ok(Self::new(SeriesKey::parse(series)?, column, bucket))
            }
            _ => Err(StorageError::Corruption(format!("bad field id: {}", raw))),
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{:x}", self.series, self.column, self.bucket)
    }
}

/// Bucket key for a timestamp (floor division, correct for negative times)
pub fn bucket_of(timestamp: i64, bucket_width: i64) -> i64 {
    timestamp.div_euclid(bucket_width)
}

/// One value of a multi-field point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    /// Column name
    pub name: String,
    /// Raw value bits
    pub value: i64,
    /// Whether `value` holds an IEEE-754 double
    pub fp: bool,
}

impl FieldValue {
    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: value.to_bits() as i64,
            fp: true,
        }
    }

    pub fn long(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
            fp: false,
        }
    }
}

/// An incoming observation: one timestamp, one tag-set, one or more columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub measurement: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub timestamp: i64,
    pub fields: Vec<FieldValue>,
}

impl PointRecord {
    /// Create a record with no columns; add them with `float` / `long`
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            timestamp,
            fields: Vec::new(),
        }
    }

    /// Build a record from parallel arrays, as the wire layer delivers them
    ///
    /// Rejects the record if the name, value and fp counts disagree.
    pub fn from_parts(
        measurement: impl Into<String>,
        tags: Vec<Tag>,
        timestamp: i64,
        names: Vec<String>,
        values: Vec<i64>,
        fps: Vec<bool>,
    ) -> StorageResult<Self> {
        if names.len() != values.len() || values.len() != fps.len() {
            return Err(StorageError::Validation(format!(
                "field count mismatch: {} names, {} values, {} fp flags",
                names.len(),
                values.len(),
                fps.len()
            )));
        }
        let fields = names
            .into_iter()
            .zip(values)
            .zip(fps)
            .map(|((name, value), fp)| FieldValue { name, value, fp })
            .collect();
        Ok(Self {
            measurement: measurement.into(),
            tags,
            timestamp,
            fields,
        })
    }

    /// Builder method: add a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Builder method: add a floating point column
    pub fn float(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.push(FieldValue::float(name, value));
        self
    }

    /// Builder method: add an integer column
    pub fn long(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.push(FieldValue::long(name, value));
        self
    }

    /// Check the record before any state is touched
    pub fn validate(&self) -> StorageResult<()> {
        validate_name("measurement", &self.measurement)?;
        if self.fields.is_empty() {
            return Err(StorageError::Validation(
                "point carries no field values".to_string(),
            ));
        }
        for field in &self.fields {
            validate_name("field name", &field.name)?;
        }
        for tag in &self.tags {
            validate_name("tag key", &tag.key)?;
            validate_name("tag value", &tag.value)?;
        }
        Ok(())
    }
}

/// Time range for queries (half-open interval: [start, end))
///
/// An `end` of `i64::MAX` leaves the range unbounded above, so `i64::MAX`
/// itself is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (exclusive unless `i64::MAX`), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "TimeRange: start must be less than end");
        Self { start, end }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Every representable timestamp
    pub fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    fn unbounded_above(&self) -> bool {
        self.end == i64::MAX
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && (timestamp < self.end || self.unbounded_above())
    }

    /// Inclusive range of bucket keys that can hold points of this range
    pub fn buckets(&self, bucket_width: i64) -> (i64, i64) {
        let last = if self.unbounded_above() {
            self.end
        } else {
            self.end - 1
        };
        (
            bucket_of(self.start, bucket_width),
            bucket_of(last, bucket_width),
        )
    }
}

/// Query result for one (series, column)
#[derive(Debug, Clone, Serialize)]
pub struct SeriesOutput {
    pub measurement: String,
    pub field: String,
    pub tags: Vec<Tag>,
    pub fp: bool,
    pub points: Vec<DataPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_float_bits() {
        let point = Point::from_f64(1000, 7.5);
        assert_eq!(point.as_f64(), 7.5);

        let dp = DataPoint::new(point, true);
        assert_eq!(dp.value(), 7.5);
        assert_eq!(dp.long_value(), 7);
    }

    #[test]
    fn test_series_key_sorts_tags() {
        let a = SeriesKey::new("cpu", &[Tag::new("host", "a"), Tag::new("dc", "x")]).unwrap();
        let b = SeriesKey::new("cpu", &[Tag::new("dc", "x"), Tag::new("host", "a")]).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.as_str(), "cpu,dc=x,host=a");
        assert_eq!(a.measurement(), "cpu");
        assert_eq!(a.tags(), vec![Tag::new("dc", "x"), Tag::new("host", "a")]);
    }

    #[test]
    fn test_series_key_rejects_reserved() {
        assert!(SeriesKey::new("cpu", &[Tag::new("ho=st", "a")]).is_err());
        assert!(SeriesKey::new("", &[]).is_err());
        assert!(SeriesKey::new("c~pu", &[]).is_err());
    }

    #[test]
    fn test_field_id_parse() {
        let series = SeriesKey::new("cpu", &[Tag::new("host", "a")]).unwrap();
        let id = FieldId::new(series, "usage", -3);
        let rendered = id.to_string();
        assert_eq!(FieldId::parse(&rendered).unwrap(), id);

        assert!(FieldId::parse("cpu#usage").is_err());
        assert!(FieldId::parse("cpu#usage#zz").is_err());
    }

    #[test]
    fn test_bucket_of_negative() {
        assert_eq!(bucket_of(0, 1024), 0);
        assert_eq!(bucket_of(1023, 1024), 0);
        assert_eq!(bucket_of(1024, 1024), 1);
        assert_eq!(bucket_of(-1, 1024), -1);
    }

    #[test]
    fn test_point_record_from_parts() {
        let record = PointRecord::from_parts(
            "cpu",
            vec![],
            1000,
            vec!["a".into(), "b".into()],
            vec![1, 2],
            vec![false],
        );
        assert!(matches!(record, Err(StorageError::Validation(_))));

        let record = PointRecord::from_parts(
            "cpu",
            vec![],
            1000,
            vec!["a".into()],
            vec![1],
            vec![false],
        )
        .unwrap();
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_point_record_validation() {
        let empty = PointRecord::new("cpu", 1000);
        assert!(matches!(empty.validate(), Err(StorageError::Validation(_))));

        let unnamed = PointRecord::new("", 1000).float("v", 1.0);
        assert!(unnamed.validate().is_err());

        let ok = PointRecord::new("cpu", 1000).tag("host", "a").float("v", 1.0);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000);

        assert!(!range.contains(999));
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
    }

    #[test]
    fn test_time_range_buckets() {
        let range = TimeRange::new(1000, 3000);
        assert_eq!(range.buckets(1024), (0, 2));

        let range = TimeRange::new(0, 1024);
        assert_eq!(range.buckets(1024), (0, 0));
    }

    #[test]
    fn test_time_range_all_covers_extremes() {
        let all = TimeRange::all();
        assert!(all.contains(i64::MIN));
        assert!(all.contains(i64::MAX));
        assert_eq!(
            all.buckets(1000),
            (bucket_of(i64::MIN, 1000), bucket_of(i64::MAX, 1000))
        );
        assert!(TimeRange::new(0, i64::MAX).contains(i64::MAX));
        assert!(!TimeRange::new(0, i64::MAX - 1).contains(i64::MAX - 1));
    }
}
