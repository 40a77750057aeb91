//! Sync session - the client-side face of progress tracking.
//!
//! A session owns the offline queue, a reconciler and an optimistic local
//! view per tracked course. Local views are never authoritative: after every
//! drain (and on demand) they are discarded and rebuilt from the server
//! snapshot plus whatever is still queued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coursetrack_core::{
    Course, CourseId, DeviceId, EventId, ProgressEvent, ProgressSnapshot, SectionId,
    StudentId, UnlockMap,
};
use coursetrack_progress::CourseProgress;
use coursetrack_storage::QueueStore;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::{EnqueueReceipt, OfflineQueue, QueueStatus};
use crate::reconciler::{DrainReport, Reconciler};
use crate::task::{SyncCommand, SyncHandle, SyncNotice, SyncTask};
use crate::transport::SyncTransport;

/// Result of [`SyncSession::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The server acknowledged the event before `submit` returned
    Acknowledged,

    /// The event is queued and will be delivered by a later drain
    Queued(EnqueueReceipt),
}

/// What [`SyncSession::refresh`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Canonical snapshot from the server
    pub server: ProgressSnapshot,

    /// Local view after rebuilding (server state plus queued events)
    pub local: ProgressSnapshot,

    /// The discarded local view showed progress the server does not have
    /// although nothing was pending
    pub diverged: bool,
}

struct LocalCourse {
    progress: CourseProgress,
    // Events reflected in `progress`, whether still queued or acknowledged.
    applied: HashSet<EventId>,
}

impl LocalCourse {
    fn new(progress: CourseProgress) -> Self {
        Self {
            progress,
            applied: HashSet::new(),
        }
    }

    /// Apply `event` unless it is already reflected. Returns whether it was.
    fn apply(&mut self, event: &ProgressEvent) -> bool {
        if !self.applied.insert(event.event_id) {
            return false;
        }
        self.progress.apply(event);
        true
    }
}

pub(crate) struct SessionCore {
    student: StudentId,
    device: DeviceId,
    queue: Arc<OfflineQueue>,
    reconciler: Reconciler,
    transport: Arc<dyn SyncTransport>,
    queue_store: Option<Arc<dyn QueueStore>>,
    courses: Mutex<HashMap<CourseId, LocalCourse>>,
    config: SyncConfig,
    online: AtomicBool,
    cancel: CancellationToken,
    notices: std::sync::Mutex<Option<mpsc::Sender<SyncNotice>>>,
    commands: std::sync::Mutex<Option<mpsc::Sender<SyncCommand>>>,
}

/// Client session for one learner on one device.
///
/// Cheap to clone; clones share the queue and local state.
#[derive(Clone)]
pub struct SyncSession {
    core: Arc<SessionCore>,
}

impl SyncSession {
    /// Open a session, restoring any queue persisted in `queue_store`.
    pub async fn open(
        student: StudentId,
        device: DeviceId,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
        queue_store: Option<Arc<dyn QueueStore>>,
    ) -> Result<Self> {
        let queue = Arc::new(OfflineQueue::new(config.queue_capacity));
        if let Some(store) = &queue_store {
            let restored = store.load_queue().await?;
            if !restored.is_empty() {
                info!(pending = restored.len(), "Restored offline queue");
            }
            queue.restore(restored);
        }

        let reconciler = Reconciler::new(queue.clone(), transport.clone(), config.clone());
        let core = SessionCore {
            student,
            device,
            queue,
            reconciler,
            transport,
            queue_store,
            courses: Mutex::new(HashMap::new()),
            config,
            online: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            notices: std::sync::Mutex::new(None),
            commands: std::sync::Mutex::new(None),
        };
        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Learner this session belongs to.
    pub fn student_id(&self) -> &StudentId {
        &self.core.student
    }

    /// Device this session runs on.
    pub fn device_id(&self) -> &DeviceId {
        &self.core.device
    }

    /// New completion event for this learner and device.
    pub fn completed(&self, section: impl Into<SectionId>, seconds: u64) -> ProgressEvent {
        ProgressEvent::completed(
            self.core.student.clone(),
            section.into(),
            seconds,
            self.core.device.clone(),
        )
    }

    /// New time-only event for this learner and device.
    pub fn time_spent(&self, section: impl Into<SectionId>, seconds: u64) -> ProgressEvent {
        ProgressEvent::time_spent(
            self.core.student.clone(),
            section.into(),
            seconds,
            self.core.device.clone(),
        )
    }

    /// Fetch a course hierarchy and start keeping a local view of it.
    pub async fn track_course(&self, course_id: &CourseId) -> Result<Arc<Course>> {
        self.core.track_course(course_id).await
    }

    /// Record an event.
    ///
    /// The event is queued first, so it survives any failure that follows.
    /// When the session is idle and believed online, a drain runs inline and
    /// the caller learns the server's verdict directly.
    pub async fn submit(&self, event: ProgressEvent) -> Result<SubmitOutcome> {
        self.core.submit(event).await
    }

    /// Local snapshot of a tracked course, or the server's for others.
    pub async fn get_snapshot(&self, course_id: &CourseId) -> Result<ProgressSnapshot> {
        if let Some(local) = self.core.courses.lock().await.get(course_id) {
            return Ok(local.progress.snapshot());
        }
        self.core
            .transport
            .fetch_snapshot(&self.core.student, course_id)
            .await
    }

    /// Local unlock map of a tracked course, or the server's for others.
    pub async fn get_unlock_state(&self, course_id: &CourseId) -> Result<UnlockMap> {
        if let Some(local) = self.core.courses.lock().await.get(course_id) {
            return Ok(local.progress.unlock_map());
        }
        self.core
            .transport
            .fetch_unlock_state(&self.core.student, course_id)
            .await
    }

    /// Next section the learner should work on in a tracked course.
    pub async fn next_section(&self, course_id: &CourseId) -> Option<SectionId> {
        self.core
            .courses
            .lock()
            .await
            .get(course_id)
            .and_then(|local| local.progress.next_section().cloned())
    }

    /// Discard the local view of a course and rebuild it from the server.
    pub async fn refresh(&self, course_id: &CourseId) -> Result<RefreshOutcome> {
        self.core.refresh(course_id).await
    }

    /// Drain the queue now, then refresh every tracked course.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.core.sync_now(&self.core.cancel).await
    }

    /// Queue summary for a "syncing" indicator.
    pub fn queue_status(&self) -> QueueStatus {
        self.core.queue.status()
    }

    /// Courses with a local view.
    pub async fn tracked_courses(&self) -> Vec<CourseId> {
        self.core.courses.lock().await.keys().cloned().collect()
    }

    /// Start the background sync task.
    ///
    /// Returns a handle for commands and a receiver of notices for the UI.
    /// Only one task should run per session.
    pub fn spawn_background(&self) -> (SyncHandle, mpsc::Receiver<SyncNotice>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (notice_tx, notice_rx) = mpsc::channel(self.core.config.notice_buffer.max(1));
        *self.core.lock_commands() = Some(command_tx.clone());
        *self.core.lock_notices() = Some(notice_tx.clone());

        let cancel = self.core.cancel.child_token();
        let task = SyncTask::new(self.core.clone(), command_rx, notice_tx, cancel.clone());
        let join = tokio::spawn(task.run());
        (SyncHandle::new(command_tx, cancel, join), notice_rx)
    }

    /// Stop all sync activity for this session (e.g. on logout).
    pub fn close(&self) {
        info!(student = %self.core.student, "Closing sync session");
        self.core.cancel.cancel();
    }
}

impl SessionCore {
    fn lock_notices(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<SyncNotice>>> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_commands(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<SyncCommand>>> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub(crate) fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Send a notice to the UI without waiting; dropped if nobody listens.
    pub(crate) fn notify(&self, notice: SyncNotice) {
        if let Some(sender) = self.lock_notices().as_ref() {
            if sender.try_send(notice).is_err() {
                debug!("Notice channel full or closed, notice dropped");
            }
        }
    }

    /// Forget the background task's channels once it has exited.
    pub(crate) fn detach_task(&self) {
        *self.lock_commands() = None;
        *self.lock_notices() = None;
    }

    fn wake_task(&self) {
        if let Some(sender) = self.lock_commands().as_ref() {
            // A full channel already holds a pending command.
            let _ = sender.try_send(SyncCommand::Wake);
        }
    }

    async fn persist_queue(&self) {
        let Some(store) = &self.queue_store else {
            return;
        };
        if let Err(e) = store.save_queue(&self.queue.entries()).await {
            warn!(error = %e, "Failed to persist offline queue");
        }
    }

    async fn fetch_course(&self, course_id: &CourseId) -> Result<Arc<Course>> {
        let structure = self.transport.fetch_course_structure(course_id).await?;
        let course = Course::from_structure(course_id.clone(), structure)
            .map_err(|e| SyncError::Corruption(format!("course {course_id}: {e}")))?;
        Ok(Arc::new(course))
    }

    async fn track_course(&self, course_id: &CourseId) -> Result<Arc<Course>> {
        if let Some(local) = self.courses.lock().await.get(course_id) {
            return Ok(local.progress.course().clone());
        }

        let course = self.fetch_course(course_id).await?;
        match self.transport.fetch_snapshot(&self.student, course_id).await {
            Ok(server) => {
                self.install(&server, course.clone()).await?;
            }
            Err(e) => {
                debug!(course = %course_id, error = %e, "No server snapshot, starting from queue");
                let mut local =
                    LocalCourse::new(CourseProgress::new(self.student.clone(), course.clone()));
                for event in self.pending_for(&course) {
                    local.apply(&event);
                }
                self.courses.lock().await.insert(course_id.clone(), local);
            }
        }
        info!(course = %course_id, sections = course.section_count(), "Tracking course");
        Ok(course)
    }

    /// Queued events that belong to `course`, in FIFO order.
    fn pending_for(&self, course: &Course) -> Vec<ProgressEvent> {
        self.queue
            .entries()
            .into_iter()
            .map(|e| e.event)
            .filter(|e| course.sections().any(|s| s.id == e.section_id))
            .collect()
    }

    /// Rebuild the local view of `course` from a server snapshot and the
    /// queue. Returns the rebuilt snapshot and whether the discarded view
    /// had diverged.
    async fn install(
        &self,
        server: &ProgressSnapshot,
        course: Arc<Course>,
    ) -> Result<(ProgressSnapshot, bool)> {
        let course_id = course.id.clone();
        let progress = match CourseProgress::from_snapshot(server, course) {
            Some(progress) => progress,
            None => {
                // The hierarchy changed since we fetched it.
                warn!(course = %course_id, "Server snapshot does not fit local hierarchy, refetching");
                let course = self.fetch_course(&course_id).await?;
                CourseProgress::from_snapshot(server, course).ok_or_else(|| {
                    SyncError::Corruption(format!(
                        "server snapshot for {course_id} does not match its hierarchy"
                    ))
                })?
            }
        };

        let pending = self.pending_for(progress.course());
        let mut local = LocalCourse::new(progress);
        for event in &pending {
            local.apply(event);
        }
        let rebuilt = local.progress.snapshot();

        let mut courses = self.courses.lock().await;
        let diverged = match courses.get(&course_id) {
            Some(old) if pending.is_empty() => !covers(server, &old.progress.snapshot()),
            _ => false,
        };
        if diverged {
            warn!(course = %course_id, "Local progress diverged from server, discarded");
        }
        if let Some(old) = courses.get(&course_id) {
            // Acknowledged events are part of the server snapshot now.
            local.applied.extend(old.applied.iter().copied());
        }
        courses.insert(course_id, local);
        Ok((rebuilt, diverged))
    }

    pub(crate) async fn refresh(&self, course_id: &CourseId) -> Result<RefreshOutcome> {
        self.refresh_with(course_id, false).await
    }

    async fn refresh_with(&self, course_id: &CourseId, refetch_hierarchy: bool) -> Result<RefreshOutcome> {
        let cached = match self.courses.lock().await.get(course_id) {
            Some(local) if !refetch_hierarchy => Some(local.progress.course().clone()),
            _ => None,
        };
        let course = match cached {
            Some(course) => course,
            None => self.fetch_course(course_id).await?,
        };

        let server = self.transport.fetch_snapshot(&self.student, course_id).await?;
        let (local, diverged) = self.install(&server, course).await?;
        if diverged {
            self.notify(SyncNotice::Diverged {
                course_id: course_id.clone(),
            });
        }
        debug!(course = %course_id, version = server.version, "Refreshed from server");
        Ok(RefreshOutcome {
            server,
            local,
            diverged,
        })
    }

    async fn apply_local(&self, event: &ProgressEvent) {
        let mut courses = self.courses.lock().await;
        let tracked = courses
            .values_mut()
            .find(|c| c.progress.course().sections().any(|s| s.id == event.section_id));
        match tracked {
            Some(local) => {
                if !local.apply(event) {
                    debug!(event_id = %event.event_id, "Event already in local view");
                }
            }
            None => debug!(section = %event.section_id, "Event for untracked section, no local view"),
        }
    }

    async fn submit(&self, event: ProgressEvent) -> Result<SubmitOutcome> {
        let idle = self.queue.is_empty() && !self.reconciler.is_draining();

        let receipt = match self.queue.enqueue(event.clone(), chrono::Utc::now()) {
            Ok(receipt) => receipt,
            Err(e) => {
                self.report_pressure();
                return Err(e.into());
            }
        };
        self.report_pressure();
        if receipt.duplicate {
            return Ok(SubmitOutcome::Queued(receipt));
        }
        self.persist_queue().await;

        if idle && self.online.load(Ordering::SeqCst) {
            match self.reconciler.drain(&self.cancel).await {
                Ok(report) => {
                    self.online.store(true, Ordering::SeqCst);
                    self.persist_queue().await;
                    if let Some(rejected) =
                        report.rejected.iter().find(|r| r.event_id == event.event_id)
                    {
                        return Err(SyncError::Validation {
                            event_id: rejected.event_id,
                            reason: rejected.reason,
                            detail: rejected.detail.clone(),
                        });
                    }
                    self.apply_local(&event).await;
                    return Ok(SubmitOutcome::Acknowledged);
                }
                Err(e) if e.is_retryable() => {
                    self.online.store(false, Ordering::SeqCst);
                    self.persist_queue().await;
                    debug!(error = %e, "Direct delivery failed, event stays queued");
                }
                Err(e) => debug!(error = %e, "Direct delivery skipped"),
            }
        }

        self.apply_local(&event).await;
        self.wake_task();
        Ok(SubmitOutcome::Queued(receipt))
    }

    fn report_pressure(&self) {
        if self.queue.take_pressure_notice() {
            warn!(
                pending = self.queue.len(),
                capacity = self.queue.capacity(),
                "Offline queue under storage pressure"
            );
            self.notify(SyncNotice::StoragePressure {
                pending: self.queue.len(),
                capacity: self.queue.capacity(),
            });
        }
    }

    /// Drain, then reconcile local views with the server.
    pub(crate) async fn sync_now(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let result = self.reconciler.drain(cancel).await;
        self.persist_queue().await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if e.is_retryable() {
                    self.online.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
        };
        self.online.store(true, Ordering::SeqCst);

        // Rejections usually mean our hierarchy is stale.
        let stale = !report.rejected.is_empty();
        if stale {
            self.notify(SyncNotice::Conflict(report.rejected.clone()));
        }

        let tracked: Vec<CourseId> = self.courses.lock().await.keys().cloned().collect();
        for course_id in tracked {
            match self.refresh_with(&course_id, stale).await {
                Ok(outcome) => self.notify(SyncNotice::SnapshotRefreshed(outcome.server)),
                Err(e) => warn!(course = %course_id, error = %e, "Failed to refresh after drain"),
            }
        }
        Ok(report)
    }
}

/// Whether `server` accounts for everything `local` shows. Other devices
/// may have added more; the server never has less.
fn covers(server: &ProgressSnapshot, local: &ProgressSnapshot) -> bool {
    local.completed_section_ids.is_subset(&server.completed_section_ids)
        && local.total_time_spent_seconds <= server.total_time_spent_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{CourseStructure, LessonOutline, SectionOutline, UnlockState};
    use coursetrack_progress::{ProgressService, StaticContentSource};
    use coursetrack_storage::MemoryStorage;

    use crate::transport::LocalTransport;

    fn structure() -> CourseStructure {
        CourseStructure {
            version: 1,
            lessons: vec![LessonOutline {
                id: "l1".into(),
                order: 1,
                sections: vec![
                    SectionOutline { id: "s1".into(), order: 1 },
                    SectionOutline { id: "s2".into(), order: 2 },
                ],
            }],
        }
    }

    fn server() -> Arc<ProgressService> {
        let content = StaticContentSource::new().with_course(CourseId::new("c"), structure());
        Arc::new(ProgressService::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(content),
        ))
    }

    async fn session(transport: Arc<LocalTransport>, store: Option<Arc<dyn QueueStore>>) -> SyncSession {
        SyncSession::open("st".into(), "phone".into(), transport, SyncConfig::default(), store)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn online_submit_is_acknowledged() {
        let transport = Arc::new(LocalTransport::new(server()));
        let session = session(transport.clone(), None).await;
        let course = CourseId::new("c");
        session.track_course(&course).await.unwrap();

        let outcome = session.submit(session.completed("s1", 30)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Acknowledged);
        assert_eq!(session.queue_status().pending, 0);

        let unlock = session.get_unlock_state(&course).await.unwrap();
        assert_eq!(unlock[&SectionId::new("s2")], UnlockState::Unlocked);
    }

    #[tokio::test]
    async fn offline_submit_is_queued_and_applied_locally() {
        let transport = Arc::new(LocalTransport::new(server()));
        let session = session(transport.clone(), None).await;
        let course = CourseId::new("c");
        session.track_course(&course).await.unwrap();
        transport.set_online(false);

        let outcome = session.submit(session.completed("s1", 30)).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert_eq!(session.queue_status().pending, 1);

        let local = session.get_snapshot(&course).await.unwrap();
        assert!(local.is_completed(&SectionId::new("s1")));
        assert_eq!(local.course_percent, 50);
    }

    #[tokio::test]
    async fn resubmitted_event_counts_once_locally() {
        let transport = Arc::new(LocalTransport::new(server()));
        let session = session(transport.clone(), None).await;
        let course = CourseId::new("c");
        session.track_course(&course).await.unwrap();
        transport.set_online(false);

        let event = session.time_spent("s1", 30);
        session.submit(event.clone()).await.unwrap();
        let outcome = session.submit(event.clone()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(ref r) if r.duplicate));
        assert_eq!(session.queue_status().pending, 1);
        let local = session.get_snapshot(&course).await.unwrap();
        assert_eq!(local.total_time_spent_seconds, 30);
        let version = local.version;

        transport.set_online(true);
        session.submit(event.clone()).await.unwrap();
        let local = session.get_snapshot(&course).await.unwrap();
        assert_eq!(local.total_time_spent_seconds, 30);
        assert_eq!(local.version, version);

        session.drain().await.unwrap();
        let outcome = session.submit(event).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Acknowledged);
        let local = session.get_snapshot(&course).await.unwrap();
        assert_eq!(local.total_time_spent_seconds, 30);
        let server = transport
            .fetch_snapshot(&StudentId::new("st"), &course)
            .await
            .unwrap();
        assert_eq!(server.total_time_spent_seconds, 30);
    }

    #[tokio::test]
    async fn unknown_section_is_rejected_when_online() {
        let transport = Arc::new(LocalTransport::new(server()));
        let session = session(transport, None).await;

        let err = session.submit(session.completed("ghost", 5)).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(session.queue_status().pending, 0);
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let transport = Arc::new(LocalTransport::new(server()));
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStorage::new());
        transport.set_online(false);

        let first = session(transport.clone(), Some(store.clone())).await;
        first.submit(first.completed("s1", 10)).await.unwrap();
        first.submit(first.time_spent("s2", 20)).await.unwrap();
        first.close();

        let second = session(transport.clone(), Some(store)).await;
        assert_eq!(second.queue_status().pending, 2);

        transport.set_online(true);
        let report = second.drain().await.unwrap();
        assert_eq!(report.acknowledged, 2);
        assert_eq!(second.queue_status().pending, 0);
    }

    #[tokio::test]
    async fn refresh_discards_diverged_local_state() {
        let service = server();
        let transport = Arc::new(LocalTransport::new(service.clone()));
        let session = session(transport, None).await;
        let course = CourseId::new("c");
        session.track_course(&course).await.unwrap();

        // Corrupt the local view behind the server's back.
        session
            .core
            .apply_local(&session.completed("s1", 99))
            .await;

        let outcome = session.refresh(&course).await.unwrap();
        assert!(outcome.diverged);
        assert!(outcome.local.completed_section_ids.is_empty());
        assert_eq!(outcome.local, outcome.server);
    }
}
