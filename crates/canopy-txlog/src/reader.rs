// Log reader: sequential scan over transaction records.
//
// The reader walks the file from the start, validating each record's frame
// and checksum. Anything unreadable is treated as a torn tail from an
// interrupted append: the scan stops there, the bytes are reported as
// discarded, and everything before them remains valid. A record that never
// made it into the log never committed.

use std::sync::Arc;

use canopy_core::chunk::{parse_chunk_header, validate_chunk, CHUNK_HEADER_LEN};
use canopy_core::{ChunkRef, FileBackend, Result};

use crate::record::LogEntry;

/// Reads transaction records for recovery and auditing.
pub struct LogReader {
    file: Arc<dyn FileBackend>,
    position: u64,
    end: u64,
    discarded_bytes: u64,
}

impl LogReader {
    /// Creates a reader over the whole log file.
    pub fn new(file: Arc<dyn FileBackend>) -> Result<Self> {
        let end = file.len()?;
        Ok(Self {
            file,
            position: 0,
            end,
            discarded_bytes: 0,
        })
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` at the end of the valid log — either a clean end
    /// of file or a torn trailing record, which is discarded.
    pub fn next_entry(&mut self) -> Result<Option<(LogEntry, ChunkRef)>> {
        if self.position + CHUNK_HEADER_LEN as u64 > self.end {
            return Ok(self.discard_tail("incomplete record header"));
        }

        let mut header = [0u8; CHUNK_HEADER_LEN];
        self.file.read_at(self.position, &mut header)?;
        let (length, crc) = match parse_chunk_header(&header) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(self.discard_tail("implausible record length")),
        };

        let chunk = ChunkRef {
            offset: self.position,
            length,
        };
        if chunk.end() > self.end {
            return Ok(self.discard_tail("record extends past end of file"));
        }

        let mut payload = vec![0u8; length as usize];
        self.file
            .read_at(self.position + CHUNK_HEADER_LEN as u64, &mut payload)?;
        if validate_chunk(&payload, crc).is_err() {
            return Ok(self.discard_tail("record checksum mismatch"));
        }

        let entry = match LogEntry::decode(&payload) {
            Ok(entry) => entry,
            Err(_) => return Ok(self.discard_tail("undecodable record payload")),
        };

        self.position = chunk.end();
        Ok(Some((entry, chunk)))
    }

    fn discard_tail<T>(&mut self, reason: &str) -> Option<T> {
        if self.position < self.end {
            self.discarded_bytes = self.end - self.position;
            tracing::warn!(
                offset = self.position,
                bytes = self.discarded_bytes,
                reason,
                "discarding incomplete transaction log tail"
            );
        }
        None
    }

    /// The offset just past the last valid record read so far. Recovery
    /// hands this to the writer so torn bytes are overwritten.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.position
    }

    /// Bytes of torn tail discarded by this reader, if any.
    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Reads all remaining records into a vector.
    pub fn read_all(&mut self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        while let Some((entry, _)) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some((entry, _))) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
