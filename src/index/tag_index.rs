//! Tag Index - Inverted index from tags to series
//!
//! Maps "key=value" → set of series keys for tag lookups and tag metadata
//! queries.
//!
//! # Example
//! ```ignore
//! // Series of cpu where host=a and dc=east
//! let series = tag_index.find_all(&[("host", "a"), ("dc", "east")]);
//! ```
//!
//! # Design Notes
//! - In-memory only; rebuilt from series keys when a measurement loads
//! - Deduplicates series automatically

use crate::storage::types::{SeriesKey, Tag};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Inverted index for tag-based lookups
///
/// Provides O(1) lookup for tag → series mapping
#[derive(Debug, Default)]
pub struct TagIndex {
    /// "key=value" → set of series
    index: HashMap<String, HashSet<SeriesKey>>,
    /// tag key → known values (for enumeration)
    values: HashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every tag of a series
    pub fn add_series(&mut self, series: &SeriesKey) {
        for tag in series.tags() {
            self.add(&tag, series);
        }
    }

    fn add(&mut self, tag: &Tag, series: &SeriesKey) {
        self.values
            .entry(tag.key.clone())
            .or_default()
            .insert(tag.value.clone());
        self.index
            .entry(tag.to_string())
            .or_default()
            .insert(series.clone());
    }

    /// Find all series carrying every given tag (intersection)
    pub fn find_all(&self, tags: &[(&str, &str)]) -> Vec<SeriesKey> {
        if tags.is_empty() {
            return Vec::new();
        }

        let mut result: Option<HashSet<SeriesKey>> = None;
        for (key, value) in tags {
            let tag_key = format!("{}={}", key, value);
            let series: HashSet<SeriesKey> = self.index.get(&tag_key).cloned().unwrap_or_default();
            result = Some(match result {
                Some(existing) => existing.intersection(&series).cloned().collect(),
                None => series,
            });
        }

        let mut found: Vec<SeriesKey> = result.map(|s| s.into_iter().collect()).unwrap_or_default();
        found.sort();
        found
    }

    /// All values seen for a tag key, sorted
    pub fn get_values(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All known tag keys, sorted
    pub fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.values.clear();
    }
}
