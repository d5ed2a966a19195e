//! Modification descriptors.
//!
//! A [`Modification`] carries a sorted set of keys and one operation to
//! apply to each of them in a single tree pass. The operation set is closed:
//! plain writes, removals, and a compare-and-swap callback that decides per
//! key after seeing the stored value. Higher-level operations (`replace`,
//! conditional writes) are expressed through [`CompareSwap`].

use std::convert::Infallible;
use std::fmt::{self, Debug, Display};

use canopy_core::{Buffer, Error};

/// Keys longer than this are rejected before touching the tree.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// A batch of keys and the operation to apply to them.
pub struct Modification<'f> {
    /// The keys to operate on, sorted ascending with no duplicates.
    pub keys: Vec<Buffer<'static>>,
    /// The operation applied to every key in the batch.
    pub operation: Operation<'f>,
}

impl<'f> Modification<'f> {
    /// Ensures the batch is well formed: keys sorted strictly ascending and
    /// within the length limit.
    pub fn validate(&self) -> Result<(), Error> {
        for (index, key) in self.keys.iter().enumerate() {
            if key.len() > MAX_KEY_LEN {
                return Err(Error::InvalidOperation(format!(
                    "key of {} bytes exceeds maximum {}",
                    key.len(),
                    MAX_KEY_LEN
                )));
            }
            if index > 0 && self.keys[index - 1].as_slice() >= key.as_slice() {
                return Err(Error::InvalidOperation(
                    "modification keys must be sorted and unique".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Debug for Modification<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modification")
            .field("keys", &self.keys)
            .field("operation", &self.operation)
            .finish()
    }
}

/// The operation a [`Modification`] applies to each of its keys.
pub enum Operation<'f> {
    /// Store this value for every key, inserting or replacing.
    Set(Buffer<'static>),
    /// Remove the key. Removing an absent key is a no-op, not an error.
    Remove,
    /// Inspect the stored value per key and decide what to do.
    CompareSwap(CompareSwap<'f>),
}

impl Debug for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set(value) => f.debug_tuple("Set").field(value).finish(),
            Operation::Remove => f.write_str("Remove"),
            Operation::CompareSwap(_) => f.write_str("CompareSwap(..)"),
        }
    }
}

/// A callback deciding the fate of a single key after seeing its current
/// value (`None` if absent).
pub type CompareSwapFn<'f> = dyn FnMut(&[u8], Option<Buffer<'static>>) -> KeyOperation + 'f;

/// Wrapper around a [`CompareSwapFn`] used in [`Operation::CompareSwap`].
pub struct CompareSwap<'f>(pub(crate) &'f mut CompareSwapFn<'f>);

impl<'f> CompareSwap<'f> {
    /// Wraps `callback` for use in a modification.
    pub fn new(callback: &'f mut CompareSwapFn<'f>) -> Self {
        Self(callback)
    }
}

/// What a [`CompareSwapFn`] chose to do with a key.
#[derive(Debug)]
pub enum KeyOperation {
    /// Leave the key untouched.
    Skip,
    /// Store this value for the key.
    Set(Buffer<'static>),
    /// Remove the key.
    Remove,
}

/// The outcome for one key of a modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationResult {
    /// The key this result describes.
    pub key: Buffer<'static>,
    /// What happened to the key.
    pub change: KeyChange,
}

/// How a key was affected by a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// The key now stores a new value.
    Set,
    /// The key's entry was removed.
    Removed,
    /// Nothing changed (skip, or removal of an absent key).
    Unchanged,
}

/// An error returned from `compare_and_swap()`.
#[derive(Debug)]
pub enum CompareAndSwapError {
    /// The stored value did not match the conditional value. Carries the
    /// value observed so the caller can retry with an updated expectation.
    Conflict(Option<Buffer<'static>>),
    /// Another error occurred while executing the operation.
    Error(Error),
}

impl Display for CompareAndSwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareAndSwapError::Conflict(existing) => {
                write!(f, "value did not match. existing value: {:?}", existing)
            }
            CompareAndSwapError::Error(error) => {
                write!(f, "error during compare_and_swap: {}", error)
            }
        }
    }
}

impl std::error::Error for CompareAndSwapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompareAndSwapError::Error(error) => Some(error),
            CompareAndSwapError::Conflict(_) => None,
        }
    }
}

impl From<Error> for CompareAndSwapError {
    fn from(error: Error) -> Self {
        CompareAndSwapError::Error(error)
    }
}

/// An error that could come from caller code or from the engine.
///
/// Scan and modification callbacks may cancel their own batch by returning
/// [`AbortError::Other`]; engine failures travel as [`AbortError::Engine`].
/// The two paths stay distinct: a caller abort never masquerades as an
/// engine error.
#[derive(Debug)]
pub enum AbortError<CallerError: Display + Debug = Infallible> {
    /// An error raised by caller-supplied code.
    Other(CallerError),
    /// An error from the engine.
    Engine(Error),
}

impl<CallerError: Display + Debug> Display for AbortError<CallerError> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortError::Other(error) => write!(f, "aborted by caller: {}", error),
            AbortError::Engine(error) => write!(f, "storage error: {}", error),
        }
    }
}

impl<CallerError: Display + Debug> std::error::Error for AbortError<CallerError> {}

impl<CallerError: Display + Debug> From<Error> for AbortError<CallerError> {
    fn from(error: Error) -> Self {
        AbortError::Engine(error)
    }
}

impl AbortError<Infallible> {
    /// Unwraps the engine error contained within an infallible abort error.
    #[must_use]
    pub fn infallible(self) -> Error {
        match self {
            AbortError::Other(_) => unreachable!(),
            AbortError::Engine(error) => error,
        }
    }
}
