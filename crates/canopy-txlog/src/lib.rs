//! # Canopy Transaction Log
//!
//! Append-only log of committed transactions and the manager that
//! coordinates multi-tree atomic commits.
//!
//! The log is the engine's source of truth: a transaction is committed
//! exactly when its record is durable here, and recovery replays nothing —
//! it simply adopts the latest recorded root per tree. Incomplete trailing
//! records left by a crash are discarded, never reported as corruption.
//!
//! ## ⚠️ Internal Implementation Detail
//!
//! **This crate is an internal implementation detail of Canopy.** Depend on
//! the main `canopy` crate instead, which provides the stable public API.

#![warn(clippy::all)]

pub mod manager;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use manager::TransactionManager;
pub use reader::LogReader;
pub use record::{LogEntry, TransactionId, TreeRootRecord};
pub use recovery::{recover, RecoveredLog};
pub use writer::LogWriter;
