// Common test utilities for transaction log integration tests

use std::path::PathBuf;
use std::sync::Arc;

use canopy_core::{FileBackend, StdFileBackend};
use tempfile::TempDir;

/// Test fixture that provides a transaction log file in a temporary
/// directory.
pub struct LogTestFixture {
    #[allow(dead_code)]
    pub temp_dir: TempDir,
    pub log_path: PathBuf,
}

impl LogTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log_path = temp_dir.path().join("_transactions");
        Self { temp_dir, log_path }
    }

    /// Opens (or reopens) the log file backend.
    pub fn open_log(&self) -> Arc<dyn FileBackend> {
        Arc::new(StdFileBackend::open(&self.log_path).expect("Failed to open log file"))
    }
}

impl Default for LogTestFixture {
    fn default() -> Self {
        Self::new()
    }
}
