//! Chunk framing shared by tree files and the transaction log.
//!
//! Every unit of durable data (a B+Tree node, a stored value, or a
//! transaction log entry) is written as a chunk:
//!
//! ```text
//! [payload length: u32 LE] [crc32: u32 LE] [payload bytes]
//! ```
//!
//! Readers locate chunks purely by [`ChunkRef`] locators threaded through
//! parent structures; there is no chunk table. A chunk whose stored length
//! or checksum disagrees with the decoded payload is corrupt.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The number of framing bytes preceding a chunk's payload.
pub const CHUNK_HEADER_LEN: usize = 8;

/// Upper bound on a single chunk payload. Reads reject lengths above this as
/// corruption before allocating.
pub const MAX_CHUNK_LEN: u32 = 256 * 1024 * 1024;

/// Locates a chunk within a file: the offset of its frame header and the
/// length of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Byte offset of the chunk header within its file.
    pub offset: u64,
    /// Payload length in bytes, excluding the header.
    pub length: u32,
}

impl ChunkRef {
    /// Returns the offset of the first byte past this chunk.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + CHUNK_HEADER_LEN as u64 + u64::from(self.length)
    }
}

/// Computes the checksum stored in a chunk header for `payload`.
#[must_use]
pub fn chunk_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes `payload` into a framed chunk ready to be appended to a file.
pub fn encode_chunk(payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len()).map_err(|_| Error::ValueTooLarge)?;
    if length > MAX_CHUNK_LEN {
        return Err(Error::ValueTooLarge);
    }

    let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&chunk_crc(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parses a chunk header into `(payload_length, crc)`.
///
/// The length is sanity-checked against [`MAX_CHUNK_LEN`] so a corrupt
/// header cannot trigger an enormous allocation.
pub fn parse_chunk_header(header: &[u8; CHUNK_HEADER_LEN]) -> Result<(u32, u32)> {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_CHUNK_LEN {
        return Err(Error::corrupt(format!(
            "chunk length {} exceeds maximum {}",
            length, MAX_CHUNK_LEN
        )));
    }
    Ok((length, crc))
}

/// Validates `payload` against the checksum recorded in its header.
pub fn validate_chunk(payload: &[u8], expected_crc: u32) -> Result<()> {
    let actual = chunk_crc(payload);
    if actual != expected_crc {
        return Err(Error::corrupt(format!(
            "crc mismatch: stored {:#010x}, computed {:#010x}",
            expected_crc, actual
        )));
    }
    Ok(())
}
