//! Embedded, single-node, persistent key-value storage built on a
//! log-structured design: append-only segments, an in-memory key index,
//! byte-granular crash recovery, and background compaction.

mod compactor;
mod config;
mod database;
mod error;
mod record;
mod segment;

pub use config::{FsyncPolicy, StorageConfig};
pub use database::Database;
pub use error::{RecordError, SegmentError, StorageError};
pub use record::Record;
pub use segment::SegmentKind;
