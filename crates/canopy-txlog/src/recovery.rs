// Crash recovery for the transaction log.
//
// Recovery reads every valid record in order and reduces them to the
// latest committed state: the newest root per tree, the next transaction
// id, and the offset where appending resumes. Partial replay cannot
// happen — each entry already carries complete root locators, so applying
// "the latest entry per tree" is atomic by construction.

use std::collections::HashMap;
use std::sync::Arc;

use canopy_core::{ChunkRef, Error, FileBackend, Result};

use crate::reader::LogReader;
use crate::record::{LogEntry, TransactionId};

/// The durable state reconstructed from the transaction log.
#[derive(Debug)]
pub struct RecoveredLog {
    /// The most recent committed entry, if the log holds any.
    pub last_entry: Option<LogEntry>,
    /// Latest committed root per tree (a `None` root means the tree was
    /// emptied by its last transaction).
    pub tree_roots: HashMap<String, Option<ChunkRef>>,
    /// The id the next transaction will be assigned.
    pub next_transaction_id: TransactionId,
    /// The offset at which the writer resumes appending.
    pub valid_end: u64,
    /// Torn trailing bytes discarded during the scan.
    pub discarded_bytes: u64,
    /// Number of committed transactions observed.
    pub entries_recovered: usize,
}

/// Scans the log and reduces it to the latest committed state.
///
/// Ids must be strictly increasing; anything else means the file is not a
/// Canopy transaction log or has been tampered with, which is corruption
/// rather than a recoverable tail.
pub fn recover(file: Arc<dyn FileBackend>) -> Result<RecoveredLog> {
    let mut reader = LogReader::new(file)?;

    let mut last_entry: Option<LogEntry> = None;
    let mut tree_roots = HashMap::new();
    let mut entries_recovered = 0;

    while let Some((entry, _)) = reader.next_entry()? {
        if let Some(previous) = &last_entry {
            if entry.id <= previous.id {
                return Err(Error::corrupt(format!(
                    "transaction id {} follows {} in the log",
                    entry.id, previous.id
                )));
            }
        }
        for record in &entry.trees {
            tree_roots.insert(record.name.clone(), record.root);
        }
        entries_recovered += 1;
        last_entry = Some(entry);
    }

    let next_transaction_id = TransactionId(
        last_entry
            .as_ref()
            .map(|entry| entry.id.0 + 1)
            .unwrap_or(1),
    );

    Ok(RecoveredLog {
        last_entry,
        tree_roots,
        next_transaction_id,
        valid_end: reader.valid_end(),
        discarded_bytes: reader.discarded_bytes(),
        entries_recovered,
    })
}
