//! # Canopy Core
//!
//! Core types shared by the Canopy storage engine crates: the error type,
//! the copy-on-write [`Buffer`], the chunk frame used for all durable data,
//! and the [`FileBackend`] abstraction the engine reads and writes through.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Canopy.** Depend on
//! the main `canopy` crate instead, which provides the stable public API.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod chunk;
pub mod error;
pub mod io;

pub use buffer::Buffer;
pub use chunk::{ChunkRef, CHUNK_HEADER_LEN, MAX_CHUNK_LEN};
pub use error::{Error, Result};
pub use io::{FileBackend, StdFileBackend};
