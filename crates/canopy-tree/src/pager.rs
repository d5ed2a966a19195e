//! Buffered chunk writer and validated chunk reader.
//!
//! A [`PagedWriter`] appends framed chunks to a file starting at a
//! caller-supplied position, buffering small writes. It is the only way the
//! engine produces durable bytes: nodes, values, and (via the same frame in
//! `canopy-txlog`) log entries. Writers are exclusive per file; readers may
//! read already-durable offsets concurrently.

use std::sync::Arc;

use canopy_core::chunk::{encode_chunk, parse_chunk_header, validate_chunk, CHUNK_HEADER_LEN};
use canopy_core::{ChunkRef, Error, FileBackend, Result};

use crate::cache::ChunkCache;

const WRITE_BUFFER_LIMIT: usize = 8 * 1024;

/// Appends framed, checksummed chunks to a file.
pub struct PagedWriter<'a> {
    file: &'a dyn FileBackend,
    cache: Option<&'a ChunkCache>,
    position: u64,
    buffer: Vec<u8>,
}

impl<'a> PagedWriter<'a> {
    /// Creates a writer appending to `file` starting at `position`.
    pub fn new(file: &'a dyn FileBackend, cache: Option<&'a ChunkCache>, position: u64) -> Self {
        Self {
            file,
            cache,
            position,
            buffer: Vec::with_capacity(WRITE_BUFFER_LIMIT),
        }
    }

    /// The offset the next written byte will land at.
    #[must_use]
    pub fn current_position(&self) -> u64 {
        self.position + self.buffer.len() as u64
    }

    /// Writes `payload` as a framed chunk and returns its locator.
    ///
    /// The payload is also recorded in the chunk cache so an immediate
    /// read-back does not touch the file.
    pub fn write_chunk(&mut self, payload: &[u8]) -> Result<ChunkRef> {
        let frame = encode_chunk(payload)?;
        let chunk = ChunkRef {
            offset: self.current_position(),
            length: payload.len() as u32,
        };
        self.write(&frame)?;

        if let Some(cache) = self.cache {
            cache.insert(self.file.id(), chunk.offset, Arc::new(payload.to_vec()));
        }
        Ok(chunk)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= WRITE_BUFFER_LIMIT {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_at(self.position, &self.buffer)?;
            self.position += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flushes buffered data and returns the file position past everything
    /// written. Does not sync; durability is the committer's decision.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.position)
    }
}

/// Reads the chunk at `chunk` from `file`, consulting `cache` first.
///
/// The stored payload length must match the locator and the checksum must
/// match the payload; either mismatch is corruption and is not retried.
pub fn read_chunk(
    file: &dyn FileBackend,
    cache: Option<&ChunkCache>,
    chunk: ChunkRef,
) -> Result<Arc<Vec<u8>>> {
    if let Some(cache) = cache {
        if let Some(payload) = cache.get(file.id(), chunk.offset) {
            return Ok(payload);
        }
    }

    let mut header = [0u8; CHUNK_HEADER_LEN];
    file.read_at(chunk.offset, &mut header)?;
    let (length, crc) = parse_chunk_header(&header)?;
    if length != chunk.length {
        return Err(Error::corrupt(format!(
            "chunk at offset {} has stored length {}, locator says {}",
            chunk.offset, length, chunk.length
        )));
    }

    let mut payload = vec![0u8; length as usize];
    file.read_at(chunk.offset + CHUNK_HEADER_LEN as u64, &mut payload)?;
    validate_chunk(&payload, crc)?;

    let payload = Arc::new(payload);
    if let Some(cache) = cache {
        cache.insert(file.id(), chunk.offset, Arc::clone(&payload));
    }
    Ok(payload)
}
