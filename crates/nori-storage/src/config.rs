//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// When appended bytes are handed to the OS versus forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    Always,
    /// Fsync at most once per window; writes in between are coalesced.
    Batch(Duration),
    /// Never call fsync explicitly; rely on the OS page cache.
    Os,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Batch(Duration::from_millis(5))
    }
}

/// Configuration for a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub max_segment_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            max_segment_size: 128 * 1024 * 1024,
            fsync_policy: FsyncPolicy::default(),
        }
    }
}

impl StorageConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    #[must_use]
    pub const fn fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}
