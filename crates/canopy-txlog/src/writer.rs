// Log writer: appends committed transaction records.
//
// `append` does not return until the record is synced to the storage
// device. This is the single durability boundary for the whole engine;
// tree files are synced by the committer before the log entry is written.

use std::sync::Arc;

use canopy_core::chunk::CHUNK_HEADER_LEN;
use canopy_core::{ChunkRef, FileBackend, Result};

use crate::record::LogEntry;

/// Appends entries to the transaction log file.
pub struct LogWriter {
    file: Arc<dyn FileBackend>,
    position: u64,
}

impl LogWriter {
    /// Creates a writer appending at `position` — recovery's valid end, so
    /// a torn trailing record from a previous crash is overwritten.
    pub fn new(file: Arc<dyn FileBackend>, position: u64) -> Self {
        Self { file, position }
    }

    /// Durably appends `entry`, returning the locator of its record.
    pub fn append(&mut self, entry: &LogEntry) -> Result<ChunkRef> {
        let frame = entry.encode()?;
        let chunk = ChunkRef {
            offset: self.position,
            length: (frame.len() - CHUNK_HEADER_LEN) as u32,
        };
        self.file.write_at(self.position, &frame)?;
        self.file.sync()?;
        self.position = chunk.end();
        tracing::debug!(id = %entry.id, offset = chunk.offset, "appended transaction record");
        Ok(chunk)
    }

    /// The offset the next record will be written at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }
}
