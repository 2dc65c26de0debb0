//! Chronicle Index Structures
//!
//! - **TagIndex**: Inverted index from tags to series, one per measurement
//!
//! # Architecture
//!
//! ```text
//! Query: "cpu series where host=a"
//!        ↓
//! TagIndex: host=a → [cpu,host=a,dc=east, cpu,host=a,dc=west]
//!        ↓
//! Read only those series' buckets
//! ```

mod tag_index;

pub use tag_index::TagIndex;
