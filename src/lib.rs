//! # Chronicle Engine
//!
//! An embeddable time-series storage engine: points are grouped into series by
//! measurement and tag-set, partitioned into fixed-width time buckets, and
//! stored per column in compact delta-of-delta / XOR encoded segments.
//!
//! ## Features
//!
//! - **Compact storage**: Delta-xor and Gorilla codecs over fixed-size segments
//! - **Background compaction**: Merges a field's closed segments in place
//! - **Crash recovery**: Per-measurement recovery log plus mapped buffer files
//! - **Retention**: Whole buckets evicted once they fall out of the window
//!
//! ## Modules
//!
//! - [`storage`]: Core time-series storage engine
//! - [`index`]: Tag index for metadata queries
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronicle_engine::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//!
//!     engine.write_point_locked(
//!         &PointRecord::new("cpu", 1_700_000_000_000)
//!             .tag("host", "a")
//!             .float("user", 12.5)
//!             .long("procs", 311),
//!     )?;
//!
//!     let results = engine.query("cpu", "user|procs", TimeRange::all(), None, None)?;
//!     for series in results {
//!         println!("{} {}: {} points", series.measurement, series.field, series.points.len());
//!     }
//!
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    DataPoint, PointRecord, SeriesKey, SeriesOutput, StorageConfig, StorageEngine, StorageError,
    StorageResult, StorageStats, Tag, TimeRange,
};

pub use index::TagIndex;

pub use config::{Config, ConfigError, LoggingConfig};
