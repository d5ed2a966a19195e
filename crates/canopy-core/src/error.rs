//! Error types for Canopy.

use std::fmt;

/// The main error type for Canopy operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying file backend
    Io(std::io::Error),

    /// A chunk failed its length or checksum validation, or a structure
    /// could not be decoded. Corruption is fatal to the operation and is
    /// never retried.
    Corrupt(String),

    /// Serialization/deserialization error
    Serialization(String),

    /// Transaction error (log unavailable, manager shut down, ...)
    Transaction(String),

    /// The operation's arguments were invalid (unsorted keys, unknown tree)
    InvalidOperation(String),

    /// A tree name contained an invalid character or is reserved
    InvalidTreeName,

    /// A payload exceeded the maximum chunk size
    ValueTooLarge,

    /// A lock was poisoned (internal error)
    LockPoisoned,
}

impl Error {
    /// Creates a [`Error::Corrupt`] with the given message.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::Corrupt(message.into())
    }

    /// Creates a [`Error::Serialization`] with the given message.
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Error::Transaction(msg) => write!(f, "transaction error: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::InvalidTreeName => write!(f, "invalid tree name"),
            Error::ValueTooLarge => write!(f, "value too large"),
            Error::LockPoisoned => write!(f, "lock poisoned"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` type for Canopy operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::corrupt("crc mismatch at offset 42");
        assert!(err.to_string().contains("crc mismatch"));

        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
        assert!(Error::InvalidTreeName.source().is_none());
    }
}
