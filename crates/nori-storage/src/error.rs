//! Error types for the storage engine.

use thiserror::Error;

/// Errors surfaced by the record codec.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crc mismatch: expected {expected:#x}, computed {actual:#x}")]
    CrcMismatch { expected: u64, actual: u64 },

    #[error("short read: needed {needed} bytes, got {got}")]
    ShortRead { needed: usize, got: usize },
}

/// Errors surfaced by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("key not indexed in this segment")]
    NotIndexed,

    #[error("segment is not active")]
    Closed,
}

/// Errors surfaced by the database-level API.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Record(#[from] RecordError),
}
