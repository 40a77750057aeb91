//! Storage abstraction and implementations for coursetrack.
//!
//! This crate provides trait-based storage for the progress ledger, the
//! snapshot cache, imported courses and the client offline queue, with
//! in-memory, (feature `json`) JSON-file and (feature `sqlite`) SQLite
//! backends.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
#[cfg(feature = "json")]
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{CourseStore, InsertOutcome, LedgerStore, QueueStore, Result, StorageError};
pub use memory::MemoryStorage;
#[cfg(feature = "json")]
pub use json_storage::JsonStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
