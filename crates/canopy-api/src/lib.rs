//! # Canopy
//!
//! A transactional, copy-on-write key-value storage engine. Named B+Trees
//! live in per-database append-only files; a shared transaction log makes
//! commits across multiple trees atomic and crash-safe.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canopy::Roots;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let roots = Roots::open("./my-database")?;
//!     let tree = roots.tree("accounts")?;
//!
//!     tree.set("alice", "100")?;
//!     if let Some(balance) = tree.get(b"alice")? {
//!         println!("alice: {}", String::from_utf8_lossy(&balance));
//!     }
//!
//!     // Atomic transfer across two trees.
//!     let tx = roots.transaction(&["accounts", "audit"])?;
//!     tx.tree("accounts").unwrap().set("alice", "90")?;
//!     tx.tree("audit").unwrap().set("2024-01-01", "alice -10")?;
//!     tx.commit()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - A transaction's effects become visible all at once, across every tree
//!   it touched, exactly when its log record is durable.
//! - Reads and scans observe a consistent snapshot and never block writers;
//!   copy-on-write isolates them from concurrent commits.
//! - After a crash, reopening recovers the latest committed state; torn
//!   trailing log records are discarded, never partially applied.

#![warn(clippy::all)]

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub mod logging;

pub use canopy_core::{Buffer, ChunkRef, Error, FileBackend, Result, StdFileBackend};
pub use canopy_tree::{
    AbortError, ChunkCache, CompareAndSwapError, CompareSwap, CompareSwapFn, KeyChange,
    KeyOperation, Modification, ModificationResult, Operation, ScanEvaluation, TreeConfig,
    TreeFile, TreeScanner, DEFAULT_MAX_ORDER,
};
pub use canopy_txlog::{LogEntry, TransactionId, TransactionManager, TreeRootRecord};

/// Current version of Canopy.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const TRANSACTION_LOG_NAME: &str = "_transactions";
const TREE_EXTENSION: &str = "canopy";

/// A database configuration used to open a database.
#[derive(Debug, Clone)]
#[must_use]
pub struct Config {
    path: PathBuf,
    cache: Option<ChunkCache>,
    tree: TreeConfig,
}

impl Config {
    /// Creates a configuration for a database located at `path`, with no
    /// chunk cache.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: None,
            tree: TreeConfig::default(),
        }
    }

    /// Returns the default configuration for a database located at `path`:
    /// a shared chunk cache of 2000 entries capped at 64 KiB per chunk.
    pub fn default_for(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Some(ChunkCache::new(2000, 65536)),
            tree: TreeConfig::default(),
        }
    }

    /// Sets the chunk cache shared by every tree of this database.
    pub fn cache(mut self, cache: ChunkCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the maximum node fan-out for trees opened by this database.
    /// The bound is fixed per open tree; changing it for an existing tree
    /// requires rebuilding the tree.
    pub fn max_order(mut self, max_order: usize) -> Self {
        self.tree.max_order = max_order;
        self
    }

    /// Opens the database, creating the directory if needed.
    pub fn open(self) -> Result<Roots> {
        Roots::open_with(self)
    }
}

/// A multi-tree transactional database handle.
///
/// Cloning is cheap; every clone shares the same engine state. The handle
/// is the unit of open/close lifecycle: opening recovers the latest
/// committed state from the transaction log, closing flushes tree files.
pub struct Roots {
    data: Arc<RootsData>,
}

struct RootsData {
    path: PathBuf,
    cache: Option<ChunkCache>,
    tree_config: TreeConfig,
    transactions: TransactionManager,
    trees: Mutex<HashMap<String, Arc<TreeFile>>>,
}

impl Clone for Roots {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl fmt::Debug for Roots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roots")
            .field("path", &self.data.path)
            .finish_non_exhaustive()
    }
}

impl Roots {
    /// Opens (or creates) a database at `path` with default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Config::default_for(path).open()
    }

    fn open_with(config: Config) -> Result<Self> {
        let path = config.path;
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(Error::InvalidOperation(format!(
                "'{}' already exists, but is not a directory",
                path.display()
            )));
        }

        let log_file = Arc::new(StdFileBackend::open(path.join(TRANSACTION_LOG_NAME))?);
        let transactions = TransactionManager::open(log_file)?;
        tracing::info!(path = %path.display(), "database opened");

        Ok(Self {
            data: Arc::new(RootsData {
                path,
                cache: config.cache,
                tree_config: config.tree,
                transactions,
                trees: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.data.path
    }

    /// Returns the transaction manager for this database.
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.data.transactions
    }

    fn tree_path(&self, name: &str) -> PathBuf {
        self.data
            .path
            .join(format!("{}.{}", name, TREE_EXTENSION))
    }

    fn tree_file(&self, name: &str) -> Result<Arc<TreeFile>> {
        check_name(name)?;
        let mut trees = self.data.trees.lock().map_err(|_| Error::LockPoisoned)?;
        if let Some(file) = trees.get(name) {
            return Ok(Arc::clone(file));
        }

        let backend = Arc::new(StdFileBackend::open(self.tree_path(name))?);
        let root = self.data.transactions.latest_root(name)?;
        let file = Arc::new(TreeFile::open(
            backend,
            root,
            self.data.cache.clone(),
            self.data.tree_config,
        )?);
        trees.insert(name.to_string(), Arc::clone(&file));
        Ok(file)
    }

    /// Opens (or creates) the tree named `name`.
    ///
    /// The tree's visible root is exactly the one recorded by the latest
    /// durable transaction that touched it.
    pub fn tree(&self, name: impl Into<String>) -> Result<Tree> {
        let name = name.into();
        let file = self.tree_file(&name)?;
        Ok(Tree {
            roots: self.clone(),
            file,
            name,
        })
    }

    /// Returns the names of all trees contained in this database.
    pub fn tree_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.data.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stripped) = name.strip_suffix(&format!(".{}", TREE_EXTENSION)) {
                    names.push(stripped.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Removes a tree's file and cached chunks. Returns true if a tree was
    /// deleted.
    pub fn delete_tree(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let mut trees = self.data.trees.lock().map_err(|_| Error::LockPoisoned)?;
        if let Some(file) = trees.remove(name) {
            if let Some(cache) = &self.data.cache {
                cache.invalidate(file.file_id());
            }
        }

        let path = self.tree_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Begins a transaction over `trees`. Every named tree is exclusively
    /// held by the transaction until it commits or rolls back; concurrent
    /// transactions over disjoint trees proceed in parallel.
    pub fn transaction(&self, trees: &[&str]) -> Result<ExecutingTransaction> {
        let mut sorted = trees.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::InvalidOperation(
                "a transaction cannot name the same tree twice".to_string(),
            ));
        }

        let mut files = Vec::with_capacity(trees.len());
        for name in trees {
            files.push((name.to_string(), self.tree_file(name)?));
        }

        // Writer locks are taken in name order so concurrent transactions
        // over overlapping tree sets cannot deadlock.
        let mut order: Vec<usize> = (0..files.len()).collect();
        order.sort_by(|&a, &b| files[a].0.cmp(&files[b].0));
        let mut locked: Vec<usize> = Vec::with_capacity(order.len());
        for &index in &order {
            if let Err(err) = files[index].1.lock_writer() {
                for &held in &locked {
                    files[held].1.unlock_writer();
                }
                return Err(err);
            }
            locked.push(index);
        }

        // The id is allocated only once every lock is held, so id order
        // matches the order conflicting transactions will commit in.
        let id = match self.data.transactions.begin() {
            Ok(id) => id,
            Err(err) => {
                for (_, file) in &files {
                    file.unlock_writer();
                }
                return Err(err);
            }
        };
        tracing::debug!(id = %id, trees = ?trees, "transaction started");

        Ok(ExecutingTransaction {
            roots: self.clone(),
            id,
            trees: files
                .into_iter()
                .map(|(name, file)| TransactionTree { name, file })
                .collect(),
            done: false,
        })
    }

    /// Flushes every open tree and releases the handle.
    pub fn close(self) -> Result<()> {
        let trees = self.data.trees.lock().map_err(|_| Error::LockPoisoned)?;
        for file in trees.values() {
            file.sync()?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if !name.is_empty()
        && name != TRANSACTION_LOG_NAME
        && name
            .bytes()
            .all(|c| matches!(c as char, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '_'))
    {
        Ok(())
    } else {
        Err(Error::InvalidTreeName)
    }
}

/// A named collection of keys and values.
///
/// Reads go straight to the tree's published state. Each write convenience
/// method runs a single-tree transaction internally, so every durable
/// write flows through the transaction log. Use [`Roots::transaction`] to
/// batch writes or to touch several trees atomically.
#[derive(Clone)]
pub struct Tree {
    roots: Roots,
    file: Arc<TreeFile>,
    name: String,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree").field("name", &self.name).finish()
    }
}

impl Tree {
    /// The tree's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the value stored for `key`, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Buffer<'static>>> {
        self.file.get(key, false)
    }

    /// Gets the values stored for `keys`; missing keys are omitted.
    pub fn get_multiple(&self, keys: &[&[u8]]) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>> {
        self.file.get_multiple(keys, false)
    }

    /// Collects every key/value pair within `range` in ascending order.
    pub fn get_range<'k, R>(&self, range: &R) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        self.file.get_range(range, false)
    }

    /// Creates a lazy scanner over `range`. `forwards` selects the
    /// direction. The scanner observes the tree version at call time.
    pub fn scan<'k, R>(&self, range: &R, forwards: bool) -> Result<TreeScanner>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        self.file.scan(range, forwards, false)
    }

    /// Returns the first key of the tree.
    pub fn first_key(&self) -> Result<Option<Buffer<'static>>> {
        self.file.first_key(false)
    }

    /// Returns the first key and value of the tree.
    pub fn first(&self) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.file.first(false)
    }

    /// Returns the last key of the tree.
    pub fn last_key(&self) -> Result<Option<Buffer<'static>>> {
        self.file.last_key(false)
    }

    /// Returns the last key and value of the tree.
    pub fn last(&self) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.file.last(false)
    }

    /// Sets `key` to `value` in its own transaction.
    pub fn set(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<()> {
        let tx = self.roots.transaction(&[self.name.as_str()])?;
        tx.only_tree()?.set(key, value)?;
        tx.commit()
    }

    /// Sets `key` to `value`, returning the previously stored value.
    pub fn replace(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<Option<Buffer<'static>>> {
        let tx = self.roots.transaction(&[self.name.as_str()])?;
        let previous = tx.only_tree()?.replace(key, value)?;
        tx.commit()?;
        Ok(previous)
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Buffer<'static>>> {
        let tx = self.roots.transaction(&[self.name.as_str()])?;
        let removed = tx.only_tree()?.remove(key)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Compares the value of `key` against `old`; on a match, sets it to
    /// `new` (or removes it when `new` is `None`). On a mismatch the
    /// transaction rolls back and the observed value is returned for retry.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<Buffer<'_>>,
    ) -> std::result::Result<(), CompareAndSwapError> {
        let tx = self.roots.transaction(&[self.name.as_str()])?;
        match tx.only_tree()?.compare_and_swap(key, old, new) {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(conflict) => {
                tx.rollback();
                Err(conflict)
            }
        }
    }

    /// Executes a batched modification in its own transaction.
    pub fn modify(&self, modification: Modification<'_>) -> Result<Vec<ModificationResult>> {
        let tx = self.roots.transaction(&[self.name.as_str()])?;
        let results = tx.only_tree()?.modify(modification)?;
        tx.commit()?;
        Ok(results)
    }
}

/// An executing transaction. While it exists, the trees it names accept no
/// other writers. Dropping it without committing rolls everything back.
#[must_use]
pub struct ExecutingTransaction {
    roots: Roots,
    id: TransactionId,
    trees: Vec<TransactionTree>,
    done: bool,
}

impl ExecutingTransaction {
    /// The transaction's id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Accesses the transaction's view of the tree named `name`, if it was
    /// part of the transaction.
    #[must_use]
    pub fn tree(&self, name: &str) -> Option<&TransactionTree> {
        self.trees.iter().find(|tree| tree.name == name)
    }

    /// The trees this transaction holds, in the order they were named.
    #[must_use]
    pub fn trees(&self) -> &[TransactionTree] {
        &self.trees
    }

    pub(crate) fn only_tree(&self) -> Result<&TransactionTree> {
        self.trees.first().ok_or_else(|| {
            Error::Transaction("transaction holds no trees".to_string())
        })
    }

    /// Commits the transaction: tree files are flushed, one log record is
    /// durably appended, and then every new root is published atomically.
    /// Once this returns, the changes are visible to all readers and will
    /// survive a crash.
    pub fn commit(mut self) -> Result<()> {
        let mut records = Vec::with_capacity(self.trees.len());
        for tree in &self.trees {
            // Tree data must be durable before the log record that
            // references it.
            tree.file.sync()?;
            records.push(TreeRootRecord {
                name: tree.name.clone(),
                root: tree.file.working_root()?,
            });
        }

        self.roots.data.transactions.commit(self.id, records)?;
        // The commit is durable; publish even if a later step errors.
        self.done = true;

        for tree in &self.trees {
            tree.file.publish()?;
            tree.file.unlock_writer();
        }
        tracing::debug!(id = %self.id, "transaction committed");
        Ok(())
    }

    /// Rolls the transaction back, discarding staged writes. Dropping the
    /// transaction without committing has the same effect.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for ExecutingTransaction {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for tree in &self.trees {
            let _ = tree.file.rollback();
            tree.file.unlock_writer();
        }
        self.roots.data.transactions.abort(self.id);
        tracing::debug!(id = %self.id, "transaction rolled back");
    }
}

/// A tree held by an [`ExecutingTransaction`].
///
/// Writes stage into the tree's working snapshot; reads through this
/// handle observe staged writes, while readers outside the transaction
/// keep seeing the published state.
pub struct TransactionTree {
    name: String,
    file: Arc<TreeFile>,
}

impl TransactionTree {
    /// The tree's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<()> {
        self.file.set(key, value)
    }

    /// Sets `key` to `value`, returning the previously stored value.
    pub fn replace(
        &self,
        key: impl Into<Buffer<'static>>,
        value: impl Into<Buffer<'static>>,
    ) -> Result<Option<Buffer<'static>>> {
        self.file.replace(key, value)
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Buffer<'static>>> {
        self.file.remove(key)
    }

    /// Conditionally sets or removes `key` after comparing against `old`.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<Buffer<'_>>,
    ) -> std::result::Result<(), CompareAndSwapError> {
        self.file.compare_and_swap(key, old, new)
    }

    /// Executes a batched modification against this tree.
    pub fn modify(&self, modification: Modification<'_>) -> Result<Vec<ModificationResult>> {
        self.file.modify(modification)
    }

    /// Gets `key`, observing writes staged by this transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<Buffer<'static>>> {
        self.file.get(key, true)
    }

    /// Gets several keys at once, observing staged writes.
    pub fn get_multiple(&self, keys: &[&[u8]]) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>> {
        self.file.get_multiple(keys, true)
    }

    /// Collects every key/value pair within `range`, observing staged
    /// writes.
    pub fn get_range<'k, R>(&self, range: &R) -> Result<Vec<(Buffer<'static>, Buffer<'static>)>>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        self.file.get_range(range, true)
    }

    /// Creates a scanner over the transaction's view of the tree.
    pub fn scan<'k, R>(&self, range: &R, forwards: bool) -> Result<TreeScanner>
    where
        R: RangeBounds<&'k [u8]> + ?Sized,
    {
        self.file.scan(range, forwards, true)
    }

    /// Returns the first key and value of the transaction's view.
    pub fn first(&self) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.file.first(true)
    }

    /// Returns the last key and value of the transaction's view.
    pub fn last(&self) -> Result<Option<(Buffer<'static>, Buffer<'static>)>> {
        self.file.last(true)
    }
}

impl fmt::Debug for TransactionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTree")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tree_names_are_validated() {
        assert!(check_name("accounts").is_ok());
        assert!(check_name("a-b.c_d9").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("_transactions").is_err());
        assert!(check_name("no spaces").is_err());
        assert!(check_name("no/slash").is_err());
    }

    #[test]
    fn duplicate_trees_in_a_transaction_are_rejected() {
        let dir = tempdir().unwrap();
        let roots = Roots::open(dir.path().join("db")).unwrap();
        assert!(roots.transaction(&["a", "a"]).is_err());
    }

    #[test]
    fn tree_handles_share_state() {
        let dir = tempdir().unwrap();
        let roots = Roots::open(dir.path().join("db")).unwrap();

        let first = roots.tree("shared").unwrap();
        let second = roots.tree("shared").unwrap();
        first.set("k", "v").unwrap();
        assert_eq!(second.get(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn tree_names_lists_created_trees() {
        let dir = tempdir().unwrap();
        let roots = Roots::open(dir.path().join("db")).unwrap();
        roots.tree("beta").unwrap();
        roots.tree("alpha").unwrap();

        assert_eq!(roots.tree_names().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn delete_tree_removes_the_file() {
        let dir = tempdir().unwrap();
        let roots = Roots::open(dir.path().join("db")).unwrap();
        let tree = roots.tree("doomed").unwrap();
        tree.set("k", "v").unwrap();

        assert!(roots.delete_tree("doomed").unwrap());
        assert!(!roots.delete_tree("doomed").unwrap());
        assert!(roots.tree_names().unwrap().is_empty());
    }
}
