//! Client-side sync errors.

use std::time::Duration;

use coursetrack_core::{EventId, RejectReason, RejectedEvent};
use coursetrack_storage::StorageError;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Offline queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue is at its bound and the event may be dropped
    #[error("offline queue full ({capacity} entries)")]
    QuotaExceeded {
        /// Configured bound
        capacity: usize,
    },
}

/// Errors surfaced by the sync client.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Local queue is full
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The server refused the event synchronously; it was not queued
    #[error("event {event_id} rejected: {reason:?}")]
    Validation {
        /// Refused event
        event_id: EventId,
        /// Machine-readable reason
        reason: RejectReason,
        /// Human-readable detail
        detail: Option<String>,
    },

    /// Network failure or server unavailable; retried with backoff
    #[error("transient sync failure: {0}")]
    Transient(String),

    /// Request exceeded its timeout; retried with backoff
    #[error("sync request timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected HTTP status on a read request
    #[error("server returned {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Queued events the server rejected as structurally invalid
    #[error("{} queued event(s) rejected by the server", .0.len())]
    Conflict(Vec<RejectedEvent>),

    /// Local derived state disagrees with the server's
    #[error("local state diverged from server: {0}")]
    Corruption(String),

    /// Another drain is already running
    #[error("drain already in progress")]
    DrainInProgress,

    /// Drain aborted through its cancellation token
    #[error("sync cancelled")]
    Cancelled,

    /// Server endpoint cannot be used
    #[error("invalid server endpoint: {0}")]
    InvalidEndpoint(String),

    /// Local persistence failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether the failure is transient and will be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(SyncError::Transient("offline".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(SyncError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(!SyncError::Http { status: 404, message: String::new() }.is_retryable());
        assert!(!SyncError::Queue(QueueError::QuotaExceeded { capacity: 1 }).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }
}
