//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, bad header, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Requested database object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected input; nothing was mutated
    #[error("Validation error: {0}")]
    Validation(String),

    /// A column was written with a different value type than it was created with
    #[error("Floating point mismatch for field {0}")]
    FloatingPointMismatch(String),

    /// The segment has no room for another pair; the owner must open a new one
    #[error("Segment is full, roll over to a new segment")]
    Rollover,

    /// Write attempted against a read-only segment
    #[error("Segment is read-only, write rejected")]
    WriteRejected,

    /// Buffer allocation failed (storage exhausted or unwritable)
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Buffer header names a codec this build does not know
    #[error("Unknown codec id: {0}")]
    UnknownCodec(u8),

    /// Invalid measurement or field name pattern
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for StorageError {
    fn from(err: regex::Error) -> Self {
        StorageError::InvalidPattern(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound("cpu".to_string());
        assert_eq!(err.to_string(), "Not found: cpu");

        let err = StorageError::Rollover;
        assert_eq!(err.to_string(), "Segment is full, roll over to a new segment");

        let err = StorageError::UnknownCodec(9);
        assert_eq!(err.to_string(), "Unknown codec id: 9");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }

    #[test]
    fn test_regex_error_conversion() {
        let err: StorageError = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, StorageError::InvalidPattern(_)));
    }
}
