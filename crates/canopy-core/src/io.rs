//! File backend abstraction.
//!
//! The engine never touches a concrete file type directly; tree files and
//! the transaction log operate against [`FileBackend`]. The trait is the
//! whole contract: positioned reads, positioned writes, length, durability,
//! and truncation. [`StdFileBackend`] is the standard-filesystem
//! implementation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A file the engine can read and write at arbitrary offsets.
///
/// Implementations must be safe to share across threads. Concurrent reads
/// may proceed freely; the engine serializes writers externally, so
/// `write_at` is never called concurrently for overlapping ranges.
pub trait FileBackend: Send + Sync {
    /// Returns an identifier unique to this open file within the process.
    /// Used to key cache entries.
    fn id(&self) -> u64;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`, extending the file if
    /// needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;

    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flushes all written data to the storage device.
    fn sync(&self) -> Result<()>;

    /// Truncates the file to `new_len` bytes.
    fn truncate(&self, new_len: u64) -> Result<()>;
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// [`FileBackend`] implementation over `std::fs::File`.
#[derive(Debug)]
pub struct StdFileBackend {
    file: Mutex<File>,
    id: u64,
}

impl StdFileBackend {
    /// Opens (or creates) the file at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
        })
    }
}

impl FileBackend for StdFileBackend {
    fn id(&self) -> u64 {
        self.id
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        let file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&self, new_len: u64) -> Result<()> {
        let file = self.file.lock().map_err(|_| Error::LockPoisoned)?;
        file.set_len(new_len)?;
        Ok(())
    }
}
