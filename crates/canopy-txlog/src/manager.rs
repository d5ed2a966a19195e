// Transaction manager: id assignment and commit serialization.
//
// Invariants enforced here:
// - ids are handed out monotonically and tracked while in flight
// - records enter the log in id order (commit order == assignment order)
// - only one commit appends at a time
// - an append failure latches the manager; the log file handle is dead

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};

use canopy_core::{ChunkRef, Error, FileBackend, Result};

use crate::reader::LogReader;
use crate::record::{LogEntry, TransactionId, TreeRootRecord};
use crate::recovery::recover;
use crate::writer::LogWriter;

/// Coordinates transactions over one transaction log.
pub struct TransactionManager {
    state: Mutex<ManagerState>,
    commit_order: Condvar,
}

struct ManagerState {
    file: Arc<dyn FileBackend>,
    writer: LogWriter,
    next_id: u64,
    in_flight: BTreeSet<u64>,
    last_committed: Option<LogEntry>,
    latest_roots: HashMap<String, Option<ChunkRef>>,
    failed: bool,
}

impl TransactionManager {
    /// Opens the manager over a log file, recovering the latest committed
    /// state first.
    pub fn open(file: Arc<dyn FileBackend>) -> Result<Self> {
        let recovered = recover(Arc::clone(&file))?;
        tracing::info!(
            transactions = recovered.entries_recovered,
            discarded_bytes = recovered.discarded_bytes,
            "transaction log recovered"
        );

        let writer = LogWriter::new(Arc::clone(&file), recovered.valid_end);
        Ok(Self {
            state: Mutex::new(ManagerState {
                file,
                writer,
                next_id: recovered.next_transaction_id.0,
                in_flight: BTreeSet::new(),
                last_committed: recovered.last_entry,
                latest_roots: recovered.tree_roots,
                failed: false,
            }),
            commit_order: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManagerState>> {
        self.state.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Allocates the next transaction id and tracks it as in flight.
    pub fn begin(&self) -> Result<TransactionId> {
        let mut state = self.lock()?;
        if state.failed {
            return Err(Error::Transaction(
                "transaction log has failed; reopen the database".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.in_flight.insert(id);
        Ok(TransactionId(id))
    }

    /// Durably commits transaction `id` with the given tree roots and
    /// returns the locator of its log record.
    ///
    /// Blocks until every transaction with a lower id has committed or
    /// aborted, so the log's record order always matches id order.
    pub fn commit(&self, id: TransactionId, trees: Vec<TreeRootRecord>) -> Result<ChunkRef> {
        let mut state = self.lock()?;
        if !state.in_flight.contains(&id.0) {
            return Err(Error::Transaction(format!(
                "transaction {} is not in flight",
                id
            )));
        }

        while !state.failed && state.in_flight.iter().next() != Some(&id.0) {
            state = self
                .commit_order
                .wait(state)
                .map_err(|_| Error::LockPoisoned)?;
        }

        if state.failed {
            state.in_flight.remove(&id.0);
            self.commit_order.notify_all();
            return Err(Error::Transaction(
                "transaction log has failed; reopen the database".to_string(),
            ));
        }

        let entry = LogEntry::new(id, trees);
        let result = state.writer.append(&entry);
        state.in_flight.remove(&id.0);

        match result {
            Ok(chunk) => {
                for record in &entry.trees {
                    state.latest_roots.insert(record.name.clone(), record.root);
                }
                state.last_committed = Some(entry);
                self.commit_order.notify_all();
                Ok(chunk)
            }
            Err(err) => {
                // The log may hold a half-written record; nothing built on
                // this handle can be trusted to commit anymore.
                tracing::error!(id = %id, error = %err, "transaction log append failed");
                state.failed = true;
                self.commit_order.notify_all();
                Err(err)
            }
        }
    }

    /// Discards transaction `id` without touching durable state.
    pub fn abort(&self, id: TransactionId) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight.remove(&id.0);
            self.commit_order.notify_all();
        }
    }

    /// The most recent committed entry.
    pub fn last_committed(&self) -> Result<Option<LogEntry>> {
        Ok(self.lock()?.last_committed.clone())
    }

    /// The latest committed root for `name`, or `None` if the tree has
    /// never committed data (or was emptied by its last transaction).
    pub fn latest_root(&self, name: &str) -> Result<Option<ChunkRef>> {
        Ok(self.lock()?.latest_roots.get(name).copied().flatten())
    }

    /// Reads every committed entry from the log, oldest first. Intended for
    /// auditing; recovery uses the same scan internally.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let file = Arc::clone(&self.lock()?.file);
        let mut reader = LogReader::new(file)?;
        reader.read_all()
    }
}
