//! Client-side queue entry wrapping an undelivered event.

use serde::{Deserialize, Serialize};

use crate::event::ProgressEvent;
use crate::id::EventId;
use crate::Time;

/// A progress event waiting for server acknowledgement, plus delivery
/// metadata. Destroyed once the server acknowledges the event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// The queued event
    pub event: ProgressEvent,

    /// When it entered the queue
    pub enqueued_at: Time,

    /// Failed delivery attempts so far
    pub attempts: u32,

    /// Earliest time of the next attempt; `None` means immediately
    pub next_retry_at: Option<Time>,
}

impl SyncQueueEntry {
    /// Wrap a fresh event.
    pub fn new(event: ProgressEvent, enqueued_at: Time) -> Self {
        Self {
            event,
            enqueued_at,
            attempts: 0,
            next_retry_at: None,
        }
    }

    /// Event id of the wrapped event.
    pub fn event_id(&self) -> EventId {
        self.event.event_id
    }

    /// Whether a delivery attempt is allowed at `now`.
    pub fn is_due(&self, now: Time) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_due_immediately() {
        let now = chrono::Utc::now();
        let event = ProgressEvent::completed("st".into(), "s".into(), 0, "d".into());
        let mut entry = SyncQueueEntry::new(event, now);
        assert!(entry.is_due(now));

        entry.next_retry_at = Some(now + chrono::Duration::seconds(2));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + chrono::Duration::seconds(2)));
    }
}
