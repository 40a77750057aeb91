//! Offline queue - FIFO buffer of undelivered progress events.
//!
//! Enqueueing never waits on I/O: the queue is an in-memory deque behind a
//! short-lived lock, persisted separately by the session. Completion events
//! are never dropped; under pressure the oldest time-only entries go first.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use coursetrack_core::{EventId, ProgressEvent, SyncQueueEntry, Time};
use tracing::{debug, warn};

use crate::error::QueueError;

/// What happened on enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// The event id was already queued; nothing changed
    pub duplicate: bool,

    /// Time-only events evicted to make room
    pub dropped: Vec<EventId>,
}

/// Summary for the "syncing" indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Entries waiting for acknowledgement
    pub pending: usize,

    /// Of which completion events
    pub completions: usize,

    /// Of which time-only events
    pub time_only: usize,

    /// Enqueue time of the oldest entry
    pub oldest_enqueued_at: Option<Time>,

    /// Earliest scheduled retry, if any entry is backing off
    pub next_retry_at: Option<Time>,

    /// Queue is at or over its bound
    pub under_pressure: bool,
}

/// Bounded FIFO of [`SyncQueueEntry`].
#[derive(Debug)]
pub struct OfflineQueue {
    entries: Mutex<VecDeque<SyncQueueEntry>>,
    capacity: usize,
    pressure_reported: AtomicBool,
}

impl OfflineQueue {
    /// Create an empty queue holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            pressure_reported: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SyncQueueEntry>> {
        // Entries stay consistent even if a holder panicked mid-operation.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event.
    ///
    /// At the bound, a completion evicts the oldest time-only entry (or is
    /// admitted over the bound if there is none); a time-only event is
    /// refused with [`QueueError::QuotaExceeded`].
    pub fn enqueue(&self, event: ProgressEvent, now: Time) -> Result<EnqueueReceipt, QueueError> {
        let mut entries = self.lock();
        let mut receipt = EnqueueReceipt::default();

        if entries.iter().any(|e| e.event_id() == event.event_id) {
            debug!(event_id = %event.event_id, "Event already queued");
            receipt.duplicate = true;
            return Ok(receipt);
        }

        if entries.len() >= self.capacity {
            if !event.is_completion() {
                warn!(
                    event_id = %event.event_id,
                    capacity = self.capacity,
                    "Offline queue full, refusing time-only event"
                );
                return Err(QueueError::QuotaExceeded {
                    capacity: self.capacity,
                });
            }

            match entries.iter().position(|e| !e.event.is_completion()) {
                Some(oldest) => {
                    if let Some(evicted) = entries.remove(oldest) {
                        warn!(
                            event_id = %evicted.event_id(),
                            "Offline queue full, dropped time-only event"
                        );
                        receipt.dropped.push(evicted.event_id());
                    }
                }
                None => warn!(
                    pending = entries.len(),
                    capacity = self.capacity,
                    "Offline queue over capacity with completions only"
                ),
            }
        }

        entries.push_back(SyncQueueEntry::new(event, now));
        Ok(receipt)
    }

    /// Clone up to `max` entries from the head, in FIFO order.
    pub fn peek_batch(&self, max: usize) -> Vec<SyncQueueEntry> {
        self.lock().iter().take(max).cloned().collect()
    }

    /// Remove entries by id (acknowledged or permanently rejected).
    /// Returns how many were removed.
    pub fn remove(&self, ids: &[EventId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let ids: HashSet<&EventId> = ids.iter().collect();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.event_id()));
        let removed = before - entries.len();
        if entries.len() < self.capacity {
            self.pressure_reported.store(false, Ordering::SeqCst);
        }
        removed
    }

    /// Record a failed delivery attempt for `ids`, scheduling their next
    /// attempt `delay` after `now`.
    pub fn record_failure(&self, ids: &[EventId], now: Time, delay: Duration) {
        let ids: HashSet<&EventId> = ids.iter().collect();
        let retry_at = chrono::Duration::from_std(delay)
            .map(|d| now + d)
            .unwrap_or(now);
        for entry in self.lock().iter_mut() {
            if ids.contains(&entry.event_id()) {
                entry.attempts = entry.attempts.saturating_add(1);
                entry.next_retry_at = Some(retry_at);
            }
        }
    }

    /// Clear scheduled retries so the next drain sends immediately.
    pub fn clear_retry_schedule(&self) {
        for entry in self.lock().iter_mut() {
            entry.next_retry_at = None;
        }
    }

    /// How long until the head entry may be sent; `None` when empty.
    ///
    /// Entries go out in FIFO order, so only the head's retry schedule
    /// matters.
    pub fn due_in(&self, now: Time) -> Option<Duration> {
        let entries = self.lock();
        let head = entries.front()?;
        if head.is_due(now) {
            return Some(Duration::ZERO);
        }
        let wait = head
            .next_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Some(wait)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of every entry in FIFO order, for persistence.
    pub fn entries(&self) -> Vec<SyncQueueEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Replace the contents with persisted entries.
    pub fn restore(&self, restored: Vec<SyncQueueEntry>) {
        *self.lock() = restored.into();
    }

    /// Status for the UI.
    pub fn status(&self) -> QueueStatus {
        let entries = self.lock();
        let completions = entries.iter().filter(|e| e.event.is_completion()).count();
        QueueStatus {
            pending: entries.len(),
            completions,
            time_only: entries.len() - completions,
            oldest_enqueued_at: entries.front().map(|e| e.enqueued_at),
            next_retry_at: entries.iter().filter_map(|e| e.next_retry_at).min(),
            under_pressure: entries.len() >= self.capacity,
        }
    }

    /// Returns `true` exactly once each time the queue reaches its bound,
    /// so storage pressure is surfaced to the learner once.
    pub fn take_pressure_notice(&self) -> bool {
        let full = self.lock().len() >= self.capacity;
        full && !self.pressure_reported.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(section: &str) -> ProgressEvent {
        ProgressEvent::completed("st".into(), section.into(), 10, "d".into())
    }

    fn visit(section: &str) -> ProgressEvent {
        ProgressEvent::time_spent("st".into(), section.into(), 10, "d".into())
    }

    fn ids(queue: &OfflineQueue) -> Vec<EventId> {
        queue.entries().iter().map(|e| e.event_id()).collect()
    }

    #[test]
    fn keeps_fifo_order() {
        let queue = OfflineQueue::new(10);
        let now = chrono::Utc::now();
        let events = [done("a"), visit("b"), done("c")];
        for e in &events {
            queue.enqueue(e.clone(), now).unwrap();
        }

        let expected: Vec<_> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids(&queue), expected);
        assert_eq!(queue.peek_batch(2).len(), 2);
        assert_eq!(queue.peek_batch(2)[0].event_id(), expected[0]);
    }

    #[test]
    fn full_queue_refuses_time_only_events() {
        let queue = OfflineQueue::new(2);
        let now = chrono::Utc::now();
        queue.enqueue(done("a"), now).unwrap();
        queue.enqueue(done("b"), now).unwrap();

        assert_eq!(
            queue.enqueue(visit("c"), now),
            Err(QueueError::QuotaExceeded { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn completion_evicts_oldest_time_only_entry() {
        let queue = OfflineQueue::new(3);
        let now = chrono::Utc::now();
        let old_visit = visit("a");
        let new_visit = visit("b");
        queue.enqueue(old_visit.clone(), now).unwrap();
        queue.enqueue(done("x"), now).unwrap();
        queue.enqueue(new_visit.clone(), now).unwrap();

        let receipt = queue.enqueue(done("y"), now).unwrap();
        assert_eq!(receipt.dropped, vec![old_visit.event_id]);
        assert_eq!(queue.len(), 3);
        assert!(ids(&queue).contains(&new_visit.event_id));
    }

    #[test]
    fn completions_are_never_dropped() {
        let queue = OfflineQueue::new(1);
        let now = chrono::Utc::now();
        queue.enqueue(done("a"), now).unwrap();
        let receipt = queue.enqueue(done("b"), now).unwrap();

        assert!(receipt.dropped.is_empty());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.status().completions, 2);
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let queue = OfflineQueue::new(5);
        let now = chrono::Utc::now();
        let event = done("a");
        assert!(!queue.enqueue(event.clone(), now).unwrap().duplicate);
        assert!(queue.enqueue(event, now).unwrap().duplicate);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn head_entry_decides_when_the_queue_is_due() {
        let queue = OfflineQueue::new(5);
        let now = chrono::Utc::now();
        assert_eq!(queue.due_in(now), None);

        let first = visit("a");
        queue.enqueue(first.clone(), now).unwrap();
        assert_eq!(queue.due_in(now), Some(Duration::ZERO));

        queue.record_failure(&[first.event_id], now, Duration::from_secs(4));
        queue.enqueue(visit("b"), now).unwrap();
        assert_eq!(queue.due_in(now), Some(Duration::from_secs(4)));
        assert_eq!(
            queue.due_in(now + chrono::Duration::seconds(4)),
            Some(Duration::ZERO)
        );

        queue.clear_retry_schedule();
        assert_eq!(queue.due_in(now), Some(Duration::ZERO));
    }

    #[test]
    fn pressure_is_reported_once_per_episode() {
        let queue = OfflineQueue::new(1);
        let now = chrono::Utc::now();
        assert!(!queue.take_pressure_notice());

        let first = done("a");
        queue.enqueue(first.clone(), now).unwrap();
        assert!(queue.take_pressure_notice());
        assert!(!queue.take_pressure_notice());

        queue.remove(&[first.event_id]);
        queue.enqueue(done("b"), now).unwrap();
        assert!(queue.take_pressure_notice());
    }

    #[test]
    fn failures_schedule_retries_and_removal_acknowledges() {
        let queue = OfflineQueue::new(5);
        let now = chrono::Utc::now();
        let a = done("a");
        let b = visit("b");
        queue.enqueue(a.clone(), now).unwrap();
        queue.enqueue(b.clone(), now).unwrap();

        queue.record_failure(&[a.event_id], now, Duration::from_secs(2));
        let status = queue.status();
        assert_eq!(status.next_retry_at, Some(now + chrono::Duration::seconds(2)));
        assert_eq!(queue.entries()[0].attempts, 1);

        assert_eq!(queue.remove(&[a.event_id]), 1);
        assert_eq!(ids(&queue), vec![b.event_id]);

        queue.clear_retry_schedule();
        assert!(queue.status().next_retry_at.is_none());
    }
}
