//! Sync reconciler - drains the offline queue into the server ledger.
//!
//! Only raw events cross the wire. The server applies each one
//! idempotently, so resending after a partial failure is always safe:
//! acknowledged entries leave the queue, everything else stays for retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coursetrack_core::{EventId, ProgressEvent, RejectedEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::OfflineQueue;
use crate::transport::SyncTransport;

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests sent
    pub batches: usize,

    /// Entries acknowledged and removed
    pub acknowledged: usize,

    /// Entries the server refused permanently (also removed)
    pub rejected: Vec<RejectedEvent>,

    /// Entries still queued afterwards
    pub remaining: usize,
}

/// Clears the drain-in-progress flag when dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains an [`OfflineQueue`] through a [`SyncTransport`].
pub struct Reconciler {
    queue: Arc<OfflineQueue>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    draining: AtomicBool,
    backoff: std::sync::Mutex<Backoff>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(queue: Arc<OfflineQueue>, transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        Self {
            backoff: std::sync::Mutex::new(Backoff::new(config.backoff.clone())),
            queue,
            transport,
            config,
            draining: AtomicBool::new(false),
        }
    }

    /// The queue being drained.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// The transport in use.
    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    /// Whether a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Consecutive failed drains.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures()
    }

    /// Delay before the next retry, if the last drain failed.
    pub fn retry_delay(&self) -> Option<std::time::Duration> {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_delay()
    }

    /// Send queued entries in enqueue order until the queue is empty.
    ///
    /// Re-entrant calls fail with [`SyncError::DrainInProgress`]. On a
    /// transient failure the unacknowledged batch is scheduled for retry and
    /// the error is returned. Cancelling aborts the in-flight request;
    /// entries acknowledged before that stay removed.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let _guard = DrainGuard::acquire(&self.draining).ok_or(SyncError::DrainInProgress)?;
        let mut report = DrainReport::default();

        loop {
            let batch = self.queue.peek_batch(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            let events: Vec<ProgressEvent> = batch.into_iter().map(|e| e.event).collect();
            let ids: Vec<EventId> = events.iter().map(|e| e.event_id).collect();

            let sent = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(acknowledged = report.acknowledged, "Drain cancelled");
                    return Err(SyncError::Cancelled);
                }
                sent = tokio::time::timeout(
                    self.config.request_timeout,
                    self.transport.send_batch(&events),
                ) => sent,
            };

            let response = match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(self.fail(&ids, e)),
                Err(_) => return Err(self.fail(&ids, SyncError::Timeout(self.config.request_timeout))),
            };
            report.batches += 1;

            let removed = self.queue.remove(&response.accepted);
            report.acknowledged += removed;

            if !response.rejected.is_empty() {
                let rejected_ids: Vec<EventId> =
                    response.rejected.iter().map(|r| r.event_id).collect();
                self.queue.remove(&rejected_ids);
                for rejected in &response.rejected {
                    warn!(
                        event_id = %rejected.event_id,
                        reason = ?rejected.reason,
                        "Server rejected queued event"
                    );
                }
                report.rejected.extend(response.rejected.iter().cloned());
            }

            let unanswered: Vec<EventId> = ids
                .iter()
                .filter(|id| !response.is_accepted(id) && !response.rejected.iter().any(|r| &r.event_id == *id))
                .copied()
                .collect();
            if !unanswered.is_empty() {
                // The server could not store these; retry later rather than spin.
                return Err(self.fail(
                    &unanswered,
                    SyncError::Transient(format!("{} event(s) not acknowledged", unanswered.len())),
                ));
            }

            debug!(
                batch = report.batches,
                acknowledged = removed,
                "Batch acknowledged"
            );
        }

        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_success();
        report.remaining = self.queue.len();
        info!(
            batches = report.batches,
            acknowledged = report.acknowledged,
            rejected = report.rejected.len(),
            "Drain complete"
        );
        Ok(report)
    }

    fn fail(&self, ids: &[EventId], err: SyncError) -> SyncError {
        let delay = self
            .backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_failure();
        self.queue.record_failure(ids, chrono::Utc::now(), delay);
        warn!(
            error = %err,
            pending = self.queue.len(),
            retry_in_ms = delay.as_millis() as u64,
            "Drain failed, will retry"
        );
        err
    }
}
