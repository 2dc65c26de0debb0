//! Chronicle Storage Engine
//!
//! This module provides the core time-series storage functionality:
//!
//! - **types**: Core data structures (Point, SeriesKey, FieldId, TimeRange)
//! - **codec**: Delta-xor and Gorilla pair encodings over segment buffers
//! - **buffer** / **allocator**: Byte regions, in memory or in mapped files
//! - **segment**: One encoded buffer with its header
//! - **field**: Ordered segments of one column in one bucket
//! - **series** / **measurement**: Bucketing, tag index and recovery
//! - **recovery**: Per-measurement log of segment sequence numbers
//! - **engine**: Main storage engine orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   PointRecord → Measurement → Series → Field (bucket) → head Segment
//!
//! Read Path:
//!   Patterns → Series → Field snapshots → Decode → Filter → Merge
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chronicle_engine::storage::{PointRecord, StorageConfig, StorageEngine, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//!
//!     engine.write_point_locked(
//!         &PointRecord::new("cpu", 1_700_000_000_000)
//!             .tag("host", "a")
//!             .float("user", 12.5),
//!     )?;
//!
//!     let series = engine.query("cpu", "user", TimeRange::all(), None, None)?;
//!     println!("Found {} series", series.len());
//!
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod buffer;
pub mod codec;
pub mod engine;
pub mod error;
pub mod field;
pub mod measurement;
pub mod predicate;
pub mod recovery;
pub mod segment;
pub mod series;
pub mod types;

// Re-export commonly used types
pub use allocator::{AllocatorKind, AllocatorStats, BufferAllocator, BufferId};
pub use codec::CodecKind;
pub use engine::{compile_pattern, MaintenanceReport, StorageConfig, StorageEngine, StorageStats};
pub use error::{StorageError, StorageResult};
pub use field::{Field, FieldSettings};
pub use measurement::{Measurement, MeasurementStats};
pub use predicate::{TagEquals, TagFilter, ValuePredicate};
pub use series::{CompactionSummary, GcSummary, Series};
pub use types::{
    DataPoint, FieldId, FieldValue, Point, PointRecord, SeriesKey, SeriesOutput, Tag, TimeRange,
};
