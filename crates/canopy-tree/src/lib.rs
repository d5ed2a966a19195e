//! # Canopy Tree
//!
//! Append-only, copy-on-write B+Tree engine for Canopy: chunked node
//! storage, a shared chunk cache, batched modifications, and versioned
//! range scans.
//!
//! A tree never mutates durable data. Every modification writes new chunks
//! and produces a new root locator; the previous root keeps serving readers
//! until it is unreferenced. [`TreeFile`] tracks two snapshots: the
//! *published* snapshot that reads observe, and the *working* snapshot that
//! an in-progress transaction mutates. Committing publishes the working
//! snapshot; rolling back discards it.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Canopy.** Depend on
//! the main `canopy` crate instead, which provides the stable public API.

#![warn(clippy::all)]

use std::fmt::{self, Debug, Display};
use std::ops::RangeBounds;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use canopy_core::{Buffer, ChunkRef, Error, FileBackend, Result};

pub mod cache;
pub mod modify;
pub mod node;
pub mod pager;
pub mod scan;

pub use cache::ChunkCache;
pub use modify::{
    AbortError, CompareAndSwapError, CompareSwap, CompareSwapFn, KeyChange, KeyOperation,
    Modification, ModificationResult, Operation, MAX_KEY_LEN,
};
pub use pager::PagedWriter;
pub use scan::{ScanEvaluation, TreeScanner};

use node::TreeContext;
use pager::read_chunk as read_chunk_internal;

/// The default maximum number of entries per node.
pub const DEFAULT_MAX_ORDER: usize = 100;

/// Per-tree configuration, fixed at open time.
///
/// Changing the order of an existing tree requires rebuilding it; the value
/// only shapes nodes written after the change, which would violate the
/// occupancy invariants of nodes already on disk.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Maximum number of entries per node (the tree's fan-out).
    pub max_order: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_order: DEFAULT_MAX_ORDER,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SnapshotState {
    root: Option<ChunkRef>,
    write_position: u64,
}

/// A versioned B+Tree stored in one append-only file.
///
/// Reads go against the published snapshot and never block. Writes require
/// the tree's writer lock (one writer at a time), stage into the working
/// snapshot, and become visible only when [`TreeFile::publish`] is called —
/// which the transaction layer does after the commit is durable.
pub struct TreeFile {
    file: Arc<dyn FileBackend>,
    cache: Option<ChunkCache>,
    max_order: usize,
    published: RwLock<SnapshotState>,
    working: Mutex<SnapshotState>,
    writer_locked: Mutex<bool>,
    writer_released: Condvar,
}

impl Debug for TreeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeFile")
            .field("file_id", &self.file.id())
            .field("max_order", &self.max_order)
            .finish_non_exhaustive()
    }
}

impl TreeFile {
    /// Opens a tree over `file` whose latest committed root is `root`
    /// (`None` for a tree that has never committed data).
    pub fn open(
        file: Arc<dyn FileBackend>,
        root: Option<ChunkRef>,
        cache: Option<ChunkCache>,
        config: TreeConfig,
    ) -> Result<Self> {
        if config.max_order < 4 {
            return Err(Error::InvalidOperation(
                "max_order must be at least 4".to_string(),
            ));
        }
        let write_position = file.len()?;
        let snapshot = SnapshotState {
            root,
            write_position,
        };
        Ok(Self {
            file,
            cache,
            max_order: config.max_order,
            published: RwLock::new(snapshot),
            working: Mutex::new(snapshot),
            writer_locked: Mutex::new(false),
            writer_released: Condvar::new(),
        })
    }

    /// The cache key identity of the underlying file.
    #[must_use]
    pub fn file_id(&self) -> u64 {
        self.file.id()
    }

    fn context(&self) -> TreeContext<'_> {
        TreeContext {
            file: self.file.as_ref(),
            cache: self.cache.as_ref(),
            max_order: self.max_order,
        }
    }

    fn snapshot(&self, in_transaction: bool) -> Result<SnapshotState> {
        if in_transaction {
            Ok(*self.working.lock().map_err(|_| Error::LockPoisoned)?)
        } else {
            Ok(*self.published.read().map_err(|_| Error::LockPoisoned)?)
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Gets the value stored for `key`. With `in_transaction`, uncommitted
    /// writes staged by the current transaction are visible.
    pub fn get(&self, key: &[u8], in_transaction: bool) -> Result<Option<Buffer<'static>>> {
        let snapshot = self.snapshot(in_transaction)?;
        match snapshot.root {
            Some(root) => node::get_value(&self.context(), root, key),
            None => Ok(None),
        }
    }

    /// Gets the values stored for `keys`. Missing keys are omitted from the
    /// result rather than reported as errors.
    pub fn get_multiple(
        &self,
        keys: &[&[u8]],
        in_transaction: bool,
    ) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>> {
        let snapshot = self.snapshot(in_transaction)?;
        let Some(root) = snapshot.root else {
            return Ok(Vec::new());
        };
        let ctx = self.context();
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = node::get_value(&ctx, root, key)? {
                found.push((Buffer::owned(key.to_vec()), value));
            }
        }
        Ok(found)
    }

    /// Creates a lazy scanner over `range`, walking forward or backward.
    ///
    /// The scanner observes the tree version current when this method is
    /// called; later commits do not affect it.
    pub fn scan<'k, R>(
        &self,
        range: &R,
        forwards: bool,
        in_transaction: bool,
    ) -> Result<TreeScanner>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        let snapshot = self.snapshot(in_transaction)?;
        let (start, end) = scan::owned_bounds(range);
        Ok(TreeScanner::new(
            Arc::clone(&self.file),
            self.cache.clone(),
            snapshot.root,
            start,
            end,
            forwards,
        ))
    }

    /// Collects every key/value pair within `range` in ascending order.
    pub fn get_range<'k, R>(
        &self,
        range: &R,
        in_transaction: bool,
    ) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        self.scan(range, true, in_transaction)?.collect()
    }

    /// Scans `range`, letting `key_evaluator` steer the traversal: values
    /// are only read for [`ScanEvaluation::ReadData`], and
    /// [`ScanEvaluation::Stop`] ends the scan. `data_callback` may cancel
    /// the whole scan with a caller error carried by [`AbortError::Other`].
    pub fn scan_with<'k, R, CallerError>(
        &self,
        range: &R,
        forwards: bool,
        in_transaction: bool,
        key_evaluator: &mut dyn FnMut(&Buffer<'static>) -> ScanEvaluation,
        data_callback: &mut dyn FnMut(
            Buffer<'static>,
            Buffer<'static>,
        ) -> std::result::Result<(), AbortError<CallerError>>,
    ) -> std::result::Result<(), AbortError<CallerError>>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
        CallerError: Display + Debug,
    {
        let mut scanner = self.scan(range, forwards, in_transaction)?;
        while let Some(entry) = scanner.next_entry()? {
            let key = Buffer::owned(entry.key.clone());
            match key_evaluator(&key) {
                ScanEvaluation::Stop => break,
                ScanEvaluation::Skip => continue,
                ScanEvaluation::ReadData => {
                    let value = scanner.resolve(&entry.value)?;
                    data_callback(key, value)?;
                }
            }
        }
        Ok(())
    }

    /// Returns the first key of the tree, if any.
    pub fn first_key(&self, in_transaction: bool) -> Result<Option<Buffer<'static>>> {
        let mut scanner = self.scan(&(..), true, in_transaction)?;
        Ok(scanner.next_entry()?.map(|entry| Buffer::owned(entry.key)))
    }

    /// Returns the first key and value of the tree, if any.
    pub fn first(&self, in_transaction: bool) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.scan(&(..), true, in_transaction)?.next().transpose()
    }

    /// Returns the last key of the tree, if any.
    pub fn last_key(&self, in_transaction: bool) -> Result<Option<Buffer<'static>>> {
        let mut scanner = self.scan(&(..), false, in_transaction)?;
        Ok(scanner.next_entry()?.map(|entry| Buffer::owned(entry.key)))
    }

    /// Returns the last key and value of the tree, if any.
    pub fn last(&self, in_transaction: bool) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.scan(&(..), false, in_transaction)?.next().transpose()
    }

    // ------------------------------------------------------------------
    // Writes (staged into the working snapshot)
    // ------------------------------------------------------------------

    /// Executes a batched modification against the working snapshot.
    ///
    /// New chunks are appended to the file immediately, but the new root
    /// stays private to the working snapshot until [`TreeFile::publish`].
    pub fn modify(&self, modification: Modification<'_>) -> Result<Vec<ModificationResult>> {
        let mut working = self.working.lock().map_err(|_| Error::LockPoisoned)?;
        let ctx = self.context();
        let mut writer = pager::PagedWriter::new(
            self.file.as_ref(),
            self.cache.as_ref(),
            working.write_position,
        );
        let (root, results) = node::modify_tree(&ctx, working.root, modification, &mut writer)?;
        let end = writer.finish()?;
        working.root = root;
        working.write_position = end;
        tracing::trace!(
            file_id = self.file.id(),
            keys = results.len(),
            "modification applied"
        );
        Ok(results)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<()> {
        self.modify(Modification {
            keys: vec![key.into()],
            operation: Operation::Set(value.into()),
        })?;
        Ok(())
    }

    /// Sets `key` to `value` and returns the previously stored value, if
    /// one was present.
    pub fn replace(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<Option<Buffer<'static>>> {
        let mut value = Some(value.into());
        let mut previous = None;
        let mut callback = |_key: &[u8], stored: Option<Buffer<'static>>| {
            previous = stored;
            match value.take() {
                Some(value) => KeyOperation::Set(value),
                None => KeyOperation::Skip,
            }
        };
        self.modify(Modification {
            keys: vec![key.into()],
            operation: Operation::CompareSwap(CompareSwap::new(&mut callback)),
        })?;
        Ok(previous)
    }

    /// Removes `key`, returning the value it held. Removing an absent key
    /// is a no-op returning `None`.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Buffer<'static>>> {
        let mut existing = None;
        let mut callback = |_key: &[u8], stored: Option<Buffer<'static>>| {
            existing = stored;
            KeyOperation::Remove
        };
        self.modify(Modification {
            keys: vec![Buffer::owned(key.to_vec())],
            operation: Operation::CompareSwap(CompareSwap::new(&mut callback)),
        })?;
        Ok(existing)
    }

    /// Compares the value of `key` against `old`. On a match the key is set
    /// to `new` (or removed when `new` is `None`); otherwise the observed
    /// value is reported in [`CompareAndSwapError::Conflict`] and nothing
    /// changes.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        mut new: Option<Buffer<'_>>,
    ) -> std::result::Result<(), CompareAndSwapError> {
        let mut outcome = Ok(());
        let mut callback = |_key: &[u8], value: Option<Buffer<'static>>| {
            if value.as_deref() == old {
                match new.take() {
                    Some(new) => KeyOperation::Set(new.into_owned()),
                    None => KeyOperation::Remove,
                }
            } else {
                outcome = Err(CompareAndSwapError::Conflict(value));
                KeyOperation::Skip
            }
        };
        self.modify(Modification {
            keys: vec![Buffer::owned(key.to_vec())],
            operation: Operation::CompareSwap(CompareSwap::new(&mut callback)),
        })?;
        outcome
    }

    // ------------------------------------------------------------------
    // Snapshot lifecycle
    // ------------------------------------------------------------------

    /// The working snapshot's root locator, recorded in the transaction log
    /// at commit.
    pub fn working_root(&self) -> Result<Option<ChunkRef>> {
        Ok(self.working.lock().map_err(|_| Error::LockPoisoned)?.root)
    }

    /// The published snapshot's root locator.
    pub fn published_root(&self) -> Result<Option<ChunkRef>> {
        Ok(self.published.read().map_err(|_| Error::LockPoisoned)?.root)
    }

    /// Atomically publishes the working snapshot so all subsequent reads
    /// observe it. Called after the commit record is durable.
    pub fn publish(&self) -> Result<()> {
        let working = *self.working.lock().map_err(|_| Error::LockPoisoned)?;
        *self.published.write().map_err(|_| Error::LockPoisoned)? = working;
        Ok(())
    }

    /// Discards staged changes, resetting the working snapshot to the
    /// published one. The next writer reuses the abandoned file region.
    pub fn rollback(&self) -> Result<()> {
        let published = *self.published.read().map_err(|_| Error::LockPoisoned)?;
        *self.working.lock().map_err(|_| Error::LockPoisoned)? = published;
        Ok(())
    }

    /// Flushes the tree file to the storage device.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    // ------------------------------------------------------------------
    // Writer exclusivity
    // ------------------------------------------------------------------

    /// Blocks until this thread holds the tree's writer lock. The lock is
    /// advisory and released with [`TreeFile::unlock_writer`]; the
    /// transaction layer holds it for the lifetime of a transaction.
    pub fn lock_writer(&self) -> Result<()> {
        let mut locked = self.writer_locked.lock().map_err(|_| Error::LockPoisoned)?;
        while *locked {
            locked = self
                .writer_released
                .wait(locked)
                .map_err(|_| Error::LockPoisoned)?;
        }
        *locked = true;
        Ok(())
    }

    /// Releases the writer lock taken by [`TreeFile::lock_writer`].
    pub fn unlock_writer(&self) {
        if let Ok(mut locked) = self.writer_locked.lock() {
            *locked = false;
            self.writer_released.notify_one();
        }
    }
}

/// Reads and validates the chunk at `chunk`, consulting `cache` first.
pub fn read_chunk(
    file: &dyn FileBackend,
    cache: Option<&ChunkCache>,
    chunk: ChunkRef,
) -> Result<Arc<Vec<u8>>> {
    read_chunk_internal(file, cache, chunk)
}
