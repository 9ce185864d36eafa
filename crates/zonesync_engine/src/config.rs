//! Configuration for the sync engine.

use std::path::PathBuf;
use std::time::Duration;

/// File name of the sync metadata journal.
pub const META_FILE_NAME: &str = "sync-meta.journal";

/// Returns the well-known location of the sync metadata journal.
///
/// This is `<data dir>/zonesync/sync-meta.journal`, falling back to the
/// current directory when the platform has no data directory.
pub fn default_meta_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zonesync")
        .join(META_FILE_NAME)
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the sync metadata journal.
    pub meta_path: PathBuf,
    /// Start an incremental sync after every observed local commit.
    pub auto_sync_on_save: bool,
    /// Maximum number of changes requested per change-feed page.
    pub change_page_size: u32,
    /// Timeout applied to every remote call.
    pub request_timeout: Duration,
    /// Journal frames written before the metadata store compacts itself.
    pub compact_after: usize,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            meta_path: default_meta_path(),
            auto_sync_on_save: true,
            change_page_size: 200,
            request_timeout: Duration::from_secs(30),
            compact_after: 512,
        }
    }

    /// Sets the metadata journal path.
    pub fn with_meta_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_path = path.into();
        self
    }

    /// Enables or disables sync after local commits.
    pub fn with_auto_sync_on_save(mut self, enabled: bool) -> Self {
        self.auto_sync_on_save = enabled;
        self
    }

    /// Sets the change-feed page size.
    pub fn with_change_page_size(mut self, size: u32) -> Self {
        self.change_page_size = size.max(1);
        self
    }

    /// Sets the remote call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how many frames trigger a journal compaction.
    pub fn with_compact_after(mut self, frames: usize) -> Self {
        self.compact_after = frames.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
