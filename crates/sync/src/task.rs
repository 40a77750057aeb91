//! Background sync task.
//!
//! Drains the offline queue whenever asked, on a timer while events are
//! pending, and on a backoff schedule after failures. Progress is reported
//! to the UI through [`SyncNotice`]s.

use std::sync::Arc;
use std::time::Duration;

use coursetrack_core::{CourseId, ProgressSnapshot, RejectedEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::reconciler::DrainReport;
use crate::session::SessionCore;

/// Commands accepted by the background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Drain now, ignoring any scheduled backoff (connectivity came back,
    /// or the user asked to sync)
    Drain,

    /// A new event was queued; drain unless the queue is backing off
    Wake,

    /// Rebuild the local view of a course from the server
    Refresh(CourseId),

    /// Stop the task
    Shutdown,
}

/// Events reported by the background task.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A drain started
    Syncing {
        /// Entries queued when it started
        pending: usize,
    },

    /// A drain finished
    Drained(DrainReport),

    /// A drain failed transiently; the next attempt is scheduled
    RetryScheduled {
        /// Consecutive failures so far
        attempt: u32,
        /// Wait before the next attempt
        delay: Duration,
        /// Failure description
        error: String,
    },

    /// Queued events were rejected permanently by the server
    Conflict(Vec<RejectedEvent>),

    /// The offline queue reached its bound
    StoragePressure {
        /// Entries queued
        pending: usize,
        /// Configured bound
        capacity: usize,
    },

    /// Local view of a course was rebuilt from this server snapshot
    SnapshotRefreshed(ProgressSnapshot),

    /// Local view of a course disagreed with the server and was discarded
    Diverged {
        /// Affected course
        course_id: CourseId,
    },

    /// The task exited
    Stopped,
}

/// Handle to a running background task.
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SyncHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<SyncCommand>,
        cancel: CancellationToken,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            cancel,
            join,
        }
    }

    /// Ask for an immediate drain. Returns `false` if the task is gone.
    pub async fn sync_now(&self) -> bool {
        self.commands.send(SyncCommand::Drain).await.is_ok()
    }

    /// Ask for a course refresh. Returns `false` if the task is gone.
    pub async fn refresh(&self, course_id: CourseId) -> bool {
        self.commands
            .send(SyncCommand::Refresh(course_id))
            .await
            .is_ok()
    }

    /// Cancel the task, aborting any in-flight request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop gracefully and wait for the task to exit.
    pub async fn shutdown(self) {
        if self.commands.send(SyncCommand::Shutdown).await.is_err() {
            self.cancel.cancel();
        }
        if let Err(e) = self.join.await {
            warn!(error = %e, "Sync task ended abnormally");
        }
    }
}

pub(crate) struct SyncTask {
    core: Arc<SessionCore>,
    commands: mpsc::Receiver<SyncCommand>,
    notices: mpsc::Sender<SyncNotice>,
    cancel: CancellationToken,
}

impl SyncTask {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        commands: mpsc::Receiver<SyncCommand>,
        notices: mpsc::Sender<SyncNotice>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core,
            commands,
            notices,
            cancel,
        }
    }

    fn notify(&self, notice: SyncNotice) {
        if self.notices.try_send(notice).is_err() {
            debug!("Notice channel full or closed, notice dropped");
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Sync task started");
        let mut next_attempt = (!self.core.queue().is_empty()).then(Instant::now);

        loop {
            let deadline = next_attempt.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Sync task cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(SyncCommand::Drain) => {
                        self.core.queue().clear_retry_schedule();
                        next_attempt = self.attempt().await;
                    }
                    Some(SyncCommand::Wake) => match self.core.queue().due_in(chrono::Utc::now()) {
                        Some(wait) if wait.is_zero() => next_attempt = self.attempt().await,
                        Some(wait) => {
                            let at = Instant::now() + wait;
                            next_attempt = Some(next_attempt.map_or(at, |next| next.min(at)));
                        }
                        None => {}
                    },
                    Some(SyncCommand::Refresh(course_id)) => {
                        if let Err(e) = self.core.refresh(&course_id).await {
                            warn!(course = %course_id, error = %e, "Refresh failed");
                        }
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(deadline), if next_attempt.is_some() => {
                    next_attempt = self.attempt().await;
                }
            }
        }

        self.notify(SyncNotice::Stopped);
        self.core.detach_task();
        info!("Sync task stopped");
    }

    /// Run one drain and decide when to try again.
    async fn attempt(&self) -> Option<Instant> {
        let pending = self.core.queue().len();
        if pending == 0 {
            return None;
        }
        self.notify(SyncNotice::Syncing { pending });

        match self.core.sync_now(&self.cancel).await {
            Ok(report) => {
                let remaining = report.remaining;
                self.notify(SyncNotice::Drained(report));
                (remaining > 0).then(Instant::now)
            }
            Err(SyncError::Cancelled) => None,
            Err(SyncError::DrainInProgress) => {
                // Someone else is draining; check back later.
                Some(Instant::now() + self.core.config().sync_interval)
            }
            Err(e) if e.is_retryable() => {
                let delay = self
                    .core
                    .reconciler()
                    .retry_delay()
                    .unwrap_or(self.core.config().backoff.initial);
                self.notify(SyncNotice::RetryScheduled {
                    attempt: self.core.reconciler().consecutive_failures(),
                    delay,
                    error: e.to_string(),
                });
                Some(Instant::now() + delay)
            }
            Err(e) => {
                warn!(error = %e, "Drain failed");
                Some(Instant::now() + self.core.config().sync_interval)
            }
        }
    }
}
