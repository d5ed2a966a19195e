// Transaction log records.
//
// A log entry is a bincode payload in the shared chunk frame:
// [length: u32 LE] [crc32: u32 LE] [payload]
//
// The payload carries the transaction id, a timestamp, and one
// (tree name, root locator) record per tree the transaction touched. The
// log is the engine's source of truth: a transaction without a log entry
// never happened.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use canopy_core::chunk::encode_chunk;
use canopy_core::{ChunkRef, Error, Result};

/// A monotonically increasing transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The new root of one tree as committed by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRootRecord {
    /// The tree's name.
    pub name: String,
    /// The tree's new root locator; `None` if the transaction emptied the
    /// tree.
    pub root: Option<ChunkRef>,
}

/// One committed transaction: the unit of durability and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The transaction's id. Ids in the log are strictly increasing.
    pub id: TransactionId,
    /// Commit wall-clock time in milliseconds since the Unix epoch.
    /// Informational only; recovery never interprets it.
    pub timestamp_millis: u64,
    /// New roots for every tree the transaction touched.
    pub trees: Vec<TreeRootRecord>,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(id: TransactionId, trees: Vec<TreeRootRecord>) -> Self {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id,
            timestamp_millis,
            trees,
        }
    }

    /// Returns the root this entry recorded for `name`, if the transaction
    /// touched that tree.
    pub fn root_for(&self, name: &str) -> Option<Option<ChunkRef>> {
        self.trees
            .iter()
            .find(|record| record.name == name)
            .map(|record| record.root)
    }

    /// Encodes this entry into a framed chunk ready for appending.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|err| Error::serialization(format!("failed to encode log entry: {}", err)))?;
        encode_chunk(&payload)
    }

    /// Decodes an entry from a checksum-validated chunk payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|err| Error::corrupt(format!("undecodable log entry: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::chunk::{parse_chunk_header, validate_chunk, CHUNK_HEADER_LEN};

    fn sample_entry() -> LogEntry {
        LogEntry::new(
            TransactionId(7),
            vec![
                TreeRootRecord {
                    name: "accounts".to_string(),
                    root: Some(ChunkRef {
                        offset: 4096,
                        length: 128,
                    }),
                },
                TreeRootRecord {
                    name: "sessions".to_string(),
                    root: None,
                },
            ],
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let entry = sample_entry();
        let frame = entry.encode().unwrap();

        let mut header = [0u8; CHUNK_HEADER_LEN];
        header.copy_from_slice(&frame[..CHUNK_HEADER_LEN]);
        let (length, crc) = parse_chunk_header(&header).unwrap();
        let payload = &frame[CHUNK_HEADER_LEN..];
        assert_eq!(payload.len(), length as usize);
        validate_chunk(payload, crc).unwrap();

        let decoded = LogEntry::decode(payload).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn root_for_distinguishes_untouched_from_emptied() {
        let entry = sample_entry();
        assert!(entry.root_for("accounts").unwrap().is_some());
        // Emptied tree: present with a None root.
        assert!(entry.root_for("sessions").unwrap().is_none());
        // Untouched tree: absent entirely.
        assert!(entry.root_for("other").is_none());
    }

    #[test]
    fn corrupted_payload_fails_to_decode() {
        let entry = sample_entry();
        let frame = entry.encode().unwrap();
        let mut payload = frame[CHUNK_HEADER_LEN..].to_vec();
        payload.truncate(payload.len() / 2);
        assert!(LogEntry::decode(&payload).is_err());
    }

    #[test]
    fn transaction_ids_order() {
        assert!(TransactionId(1) < TransactionId(2));
        assert_eq!(TransactionId(5).to_string(), "5");
    }
}
