//! Offline-first sync client
//!
//! Queues progress events locally, drains them into the server ledger with
//! backoff, and keeps an optimistic local view per course that is rebuilt
//! from the server after every successful drain.

#![warn(missing_docs)]

pub mod error;
pub mod config;
pub mod backoff;
pub mod queue;
pub mod transport;
pub mod reconciler;
pub mod session;
pub mod task;

pub use error::{QueueError, Result, SyncError};
pub use config::{BackoffConfig, SyncConfig};
pub use backoff::Backoff;
pub use queue::{EnqueueReceipt, OfflineQueue, QueueStatus};
pub use transport::{HttpTransport, LocalTransport, SyncTransport};
pub use reconciler::{DrainReport, Reconciler};
pub use session::{RefreshOutcome, SubmitOutcome, SyncSession};
pub use task::{SyncCommand, SyncHandle, SyncNotice};
