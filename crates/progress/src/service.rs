//! Progress service - ledger, aggregation and unlock gate wired together.
//!
//! Writes for one `(student, course)` pair are serialized through a
//! per-pair lock; different pairs proceed in parallel. Appends are safe
//! under concurrent calls for the same event id because the store's insert
//! is atomic on that id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use coursetrack_core::{
    AppendOutcome, BatchId, Course, CourseId, CourseStructure, CurrentPosition, DeviceId,
    ProgressEvent, ProgressSnapshot, RejectedEvent, SectionId, StudentId, SyncBatchResponse,
    UnlockMap,
};
use coursetrack_storage::LedgerStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::context::CourseProgress;
use crate::error::{ProgressError, Result, ValidationError};
use crate::hierarchy::{ContentSource, HierarchyIndex, SectionLocation};
use crate::ledger::{Ledger, LedgerConfig};
use crate::tracker::ProgressTracker;

type Key = (StudentId, CourseId);
type Slot = Arc<Mutex<Option<CourseProgress>>>;

/// Progress service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Ledger limits
    pub ledger: LedgerConfig,

    /// Write the snapshot cache after every applied event
    pub persist_snapshots: bool,

    /// Student-course contexts kept in memory; idle ones beyond this are
    /// dropped least recently used first and reloaded on demand
    pub max_contexts: usize,

    /// Current positions kept in memory; the oldest reports go first
    pub max_positions: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            persist_snapshots: true,
            max_contexts: 10_000,
            max_positions: 10_000,
        }
    }
}

impl ProgressConfig {
    /// Set ledger limits.
    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.ledger = ledger;
        self
    }

    /// Enable or disable the snapshot cache.
    pub fn with_persist_snapshots(mut self, persist: bool) -> Self {
        self.persist_snapshots = persist;
        self
    }

    /// Bound the in-memory contexts.
    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    /// Bound the in-memory position register.
    pub fn with_max_positions(mut self, max: usize) -> Self {
        self.max_positions = max;
        self
    }
}

/// Per student-course slots in least recently used order.
#[derive(Default)]
struct Contexts {
    slots: HashMap<Key, (Slot, u64)>,
    // tick -> key, oldest first
    lru: BTreeMap<u64, Key>,
    next_tick: u64,
}

impl Contexts {
    /// Slot for `key`, marking it most recently used. Idle slots beyond
    /// `max` are dropped; a slot somebody still holds is never dropped.
    fn slot(&mut self, key: Key, max: usize) -> Slot {
        self.next_tick += 1;
        let tick = self.next_tick;
        let slot = match self.slots.get_mut(&key) {
            Some((slot, used)) => {
                self.lru.remove(used);
                *used = tick;
                slot.clone()
            }
            None => {
                let slot = Slot::default();
                self.slots.insert(key.clone(), (slot.clone(), tick));
                slot
            }
        };
        self.lru.insert(tick, key);
        self.shrink(max);
        slot
    }

    fn shrink(&mut self, max: usize) {
        let excess = self.slots.len().saturating_sub(max);
        if excess == 0 {
            return;
        }
        let idle: Vec<(u64, Key)> = self
            .lru
            .iter()
            .filter(|(_, key)| {
                self.slots
                    .get(*key)
                    .is_some_and(|(slot, _)| Arc::strong_count(slot) == 1)
            })
            .take(excess)
            .map(|(tick, key)| (*tick, key.clone()))
            .collect();
        for (tick, key) in idle {
            self.lru.remove(&tick);
            self.slots.remove(&key);
        }
        debug!(contexts = self.slots.len(), "Dropped idle contexts");
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// The authoritative progress engine.
pub struct ProgressService {
    ledger: Ledger,
    content: Arc<dyn ContentSource>,
    index: RwLock<HierarchyIndex>,
    contexts: Mutex<Contexts>,
    positions: RwLock<HashMap<Key, CurrentPosition>>,
    config: ProgressConfig,
}

impl ProgressService {
    /// Create a service with the default configuration.
    pub fn new(store: Arc<dyn LedgerStore>, content: Arc<dyn ContentSource>) -> Self {
        Self::with_config(store, content, ProgressConfig::default())
    }

    /// Create a service.
    pub fn with_config(
        store: Arc<dyn LedgerStore>,
        content: Arc<dyn ContentSource>,
        config: ProgressConfig,
    ) -> Self {
        Self {
            ledger: Ledger::new(store, config.ledger.clone()),
            content,
            index: RwLock::new(HierarchyIndex::new()),
            contexts: Mutex::new(Contexts::default()),
            positions: RwLock::new(HashMap::new()),
            config,
        }
    }

    // === Hierarchy ===

    /// Load a course into the index, fetching it from the content source
    /// on first use.
    pub async fn load_course(&self, course_id: &CourseId) -> Result<Arc<Course>> {
        if let Some(course) = self.index.read().await.course(course_id) {
            return Ok(course);
        }

        let structure = self
            .content
            .get_course_structure(course_id)
            .await?
            .ok_or_else(|| ProgressError::UnknownCourse(course_id.clone()))?;
        let course = Course::from_structure(course_id.clone(), structure)?;

        let mut index = self.index.write().await;
        if let Some(existing) = index.course(course_id) {
            return Ok(existing);
        }
        let course = index.insert(course)?;
        info!(
            course_id = %course_id,
            lessons = course.lessons.len(),
            sections = course.section_count(),
            "Course indexed"
        );
        Ok(course)
    }

    /// Index every course the content source knows and the index lacks.
    ///
    /// Courses that fail to load are logged and skipped. Returns how many
    /// courses were added.
    pub async fn refresh_courses(&self) -> Result<usize> {
        let ids = self.content.list_course_ids().await?;
        let mut added = 0;
        for id in ids {
            if self.index.read().await.contains_course(&id) {
                continue;
            }
            match self.load_course(&id).await {
                Ok(_) => added += 1,
                Err(e) => warn!(course_id = %id, error = %e, "Skipping course"),
            }
        }
        Ok(added)
    }

    /// Course structure as indexed.
    pub async fn course_structure(&self, course_id: &CourseId) -> Result<CourseStructure> {
        Ok(self.load_course(course_id).await?.to_structure())
    }

    /// Locate an event's section. An unknown section triggers one catalogue
    /// refresh while `may_refresh` is set; the flag is cleared once used.
    async fn validate(
        &self,
        event: &ProgressEvent,
        may_refresh: &mut bool,
    ) -> Result<SectionLocation> {
        let unknown = {
            let index = self.index.read().await;
            match self.ledger.validate(event, &index) {
                Ok(location) => return Ok(location.clone()),
                Err(e @ ValidationError::UnknownSection(_)) => e,
                Err(e) => return Err(e.into()),
            }
        };
        if !std::mem::take(may_refresh) {
            return Err(unknown.into());
        }

        // The section may belong to a course published since we last looked.
        self.refresh_courses().await?;
        let index = self.index.read().await;
        Ok(self.ledger.validate(event, &index)?.clone())
    }

    // === Ledger ===

    /// Append an event: validate, record idempotently, then update the
    /// aggregates and unlock state of its course.
    pub async fn append(&self, event: ProgressEvent) -> Result<AppendOutcome> {
        self.append_with(event, &mut true).await
    }

    async fn append_with(
        &self,
        event: ProgressEvent,
        may_refresh: &mut bool,
    ) -> Result<AppendOutcome> {
        let location = match self.validate(&event, may_refresh).await {
            Ok(location) => location,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Event rejected");
                return Err(e);
            }
        };

        let student = event.student_id.clone();
        let slot = self.slot(&student, &location.course_id).await;
        let mut guard = slot.lock().await;
        let progress = self
            .ensure_loaded(&mut guard, &student, &location.course_id)
            .await?;

        let appended = self.ledger.append(event).await?;
        if appended.outcome == AppendOutcome::Applied {
            let effect = progress.apply(&appended.event);
            if effect.newly_completed {
                debug!(
                    student_id = %student,
                    section_id = %appended.event.section_id,
                    course_percent = progress.snapshot().course_percent,
                    "Section completed"
                );
            }
            self.persist(progress).await;
        }

        Ok(appended.outcome)
    }

    /// Append a sync batch.
    ///
    /// Accepted covers both applied and duplicate events. Validation
    /// failures are rejected; storage failures leave the event in neither
    /// list so the client retries it. The course catalogue is refreshed at
    /// most once per batch.
    pub async fn ingest_batch(&self, events: Vec<ProgressEvent>) -> SyncBatchResponse {
        let batch_id = BatchId::new();
        let total = events.len();
        let mut response = SyncBatchResponse::default();
        let mut may_refresh = true;

        for event in events {
            let event_id = event.event_id;
            match self.append_with(event, &mut may_refresh).await {
                Ok(_) => response.accepted.push(event_id),
                Err(ProgressError::Validation(v)) => response.rejected.push(RejectedEvent {
                    event_id,
                    reason: v.reject_reason(),
                    detail: Some(v.to_string()),
                }),
                Err(e) => {
                    error!(batch_id = %batch_id, event_id = %event_id, error = %e, "Event not ingested");
                }
            }
        }

        info!(
            batch_id = %batch_id,
            total,
            accepted = response.accepted.len(),
            rejected = response.rejected.len(),
            "Sync batch ingested"
        );
        response
    }

    /// Ledger entries of a student for one section, in ingestion order.
    pub async fn section_history(
        &self,
        student: &StudentId,
        section: &SectionId,
    ) -> Result<Vec<ProgressEvent>> {
        Ok(self.ledger.store().list_section_events(student, section).await?)
    }

    // === Derived state ===

    /// Current snapshot for a student and course.
    pub async fn get_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<ProgressSnapshot> {
        self.with_progress(student, course, |p| p.snapshot()).await
    }

    /// Unlock state of every section of a course.
    pub async fn get_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap> {
        self.with_progress(student, course, |p| p.unlock_map()).await
    }

    /// First unlocked, not yet completed section.
    pub async fn next_section(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<Option<SectionId>> {
        self.with_progress(student, course, |p| p.next_section().cloned())
            .await
    }

    /// Discard the cached snapshot and rebuild it from the ledger.
    pub async fn rebuild_snapshot(
        &self,
        student: &StudentId,
        course_id: &CourseId,
    ) -> Result<ProgressSnapshot> {
        let course = self.load_course(course_id).await?;
        let slot = self.slot(student, course_id).await;
        let mut guard = slot.lock().await;

        self.ledger.store().delete_snapshot(student, course_id).await?;
        let progress = self.replay(student, course).await?;
        self.persist(&progress).await;

        let snapshot = progress.snapshot();
        *guard = Some(progress);
        info!(
            student_id = %student,
            course_id = %course_id,
            version = snapshot.version,
            "Snapshot rebuilt from ledger"
        );
        Ok(snapshot)
    }

    // === Current position ===

    /// Record where a learner is. The server stamps the report; the
    /// winning position under (server timestamp, device id) is returned.
    pub async fn report_position(
        &self,
        student: &StudentId,
        course_id: &CourseId,
        section: &SectionId,
        device: &DeviceId,
    ) -> Result<CurrentPosition> {
        self.load_course(course_id).await?;
        {
            let index = self.index.read().await;
            match index.locate(section) {
                Some(location) if &location.course_id == course_id => {}
                Some(_) => {
                    return Err(ValidationError::SectionNotInCourse {
                        section: section.clone(),
                        course: course_id.clone(),
                    }
                    .into())
                }
                None => return Err(ValidationError::UnknownSection(section.clone()).into()),
            }
        }

        let report = CurrentPosition {
            student_id: student.clone(),
            course_id: course_id.clone(),
            section_id: section.clone(),
            device_id: device.clone(),
            server_timestamp: chrono::Utc::now(),
        };

        let mut positions = self.positions.write().await;
        let key = (student.clone(), course_id.clone());
        let winner = match positions.remove(&key) {
            Some(current) => CurrentPosition::resolve(current, report),
            None => {
                if positions.len() >= self.config.max_positions.max(1) {
                    let oldest = positions
                        .iter()
                        .min_by_key(|(_, p)| p.server_timestamp)
                        .map(|(k, _)| k.clone());
                    if let Some(oldest) = oldest {
                        positions.remove(&oldest);
                    }
                }
                report
            }
        };
        positions.insert(key, winner.clone());
        Ok(winner)
    }

    /// Last winning position, if any device reported one.
    pub async fn current_position(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Option<CurrentPosition> {
        self.positions
            .read()
            .await
            .get(&(student.clone(), course.clone()))
            .cloned()
    }

    /// Whether the backing store is reachable.
    pub async fn health_check(&self) -> bool {
        self.ledger.store().health_check().await
    }

    // === Internals ===

    async fn slot(&self, student: &StudentId, course: &CourseId) -> Slot {
        self.contexts
            .lock()
            .await
            .slot((student.clone(), course.clone()), self.config.max_contexts)
    }

    /// Student-course contexts currently held in memory.
    pub async fn loaded_contexts(&self) -> usize {
        self.contexts.lock().await.len()
    }

    async fn with_progress<T>(
        &self,
        student: &StudentId,
        course: &CourseId,
        f: impl FnOnce(&CourseProgress) -> T,
    ) -> Result<T> {
        let slot = self.slot(student, course).await;
        let mut guard = slot.lock().await;
        let progress = self.ensure_loaded(&mut guard, student, course).await?;
        Ok(f(&*progress))
    }

    async fn ensure_loaded<'a>(
        &self,
        slot: &'a mut Option<CourseProgress>,
        student: &StudentId,
        course_id: &CourseId,
    ) -> Result<&'a mut CourseProgress> {
        let course = self.load_course(course_id).await?;
        let progress = match slot.take() {
            Some(progress) if Arc::ptr_eq(progress.course(), &course) => progress,
            _ => self.restore(student, course).await?,
        };
        Ok(slot.insert(progress))
    }

    async fn restore(&self, student: &StudentId, course: Arc<Course>) -> Result<CourseProgress> {
        let store = self.ledger.store();
        if let Some(snapshot) = store.load_snapshot(student, &course.id).await? {
            if snapshot.student_id == *student {
                if let Some(progress) = CourseProgress::from_snapshot(&snapshot, course.clone()) {
                    debug!(
                        student_id = %student,
                        course_id = %course.id,
                        version = snapshot.version,
                        "Restored progress from snapshot cache"
                    );
                    return Ok(progress);
                }
            }
            warn!(
                student_id = %student,
                course_id = %course.id,
                "Cached snapshot does not match course, rebuilding"
            );
        }

        let progress = self.replay(student, course).await?;
        self.persist(&progress).await;
        Ok(progress)
    }

    async fn replay(&self, student: &StudentId, course: Arc<Course>) -> Result<CourseProgress> {
        let events = self.ledger.store().list_student_events(student).await?;
        let sections: HashSet<&SectionId> = course.sections().map(|s| &s.id).collect();
        let relevant: Vec<&ProgressEvent> = events
            .iter()
            .filter(|e| sections.contains(&e.section_id))
            .collect();

        debug!(
            student_id = %student,
            course_id = %course.id,
            events = relevant.len(),
            "Replaying ledger"
        );
        Ok(CourseProgress::replay(
            student.clone(),
            course.clone(),
            relevant,
        ))
    }

    async fn persist(&self, progress: &CourseProgress) {
        if !self.config.persist_snapshots {
            return;
        }
        if let Err(e) = self.ledger.store().save_snapshot(&progress.snapshot()).await {
            // The ledger already holds the event; the cache is rebuilt on next load.
            warn!(
                student_id = %progress.student_id(),
                course_id = %progress.course_id(),
                error = %e,
                "Failed to persist snapshot"
            );
        }
    }
}

#[async_trait]
impl ProgressTracker for ProgressService {
    async fn submit(&self, event: ProgressEvent) -> Result<AppendOutcome> {
        self.append(event).await
    }

    async fn ingest_batch(&self, events: Vec<ProgressEvent>) -> SyncBatchResponse {
        ProgressService::ingest_batch(self, events).await
    }

    async fn get_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<ProgressSnapshot> {
        ProgressService::get_snapshot(self, student, course).await
    }

    async fn get_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap> {
        ProgressService::get_unlock_state(self, student, course).await
    }

    async fn get_course_structure(&self, course: &CourseId) -> Result<CourseStructure> {
        self.course_structure(course).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::StaticContentSource;
    use coursetrack_core::{LessonId, LessonOutline, RejectReason, SectionOutline, UnlockState};
    use coursetrack_storage::MemoryStorage;

    /// 2 lessons x 2 sections.
    fn structure() -> CourseStructure {
        let lesson = |id: &str, order, sections: [&str; 2]| LessonOutline {
            id: id.into(),
            order,
            sections: sections
                .iter()
                .enumerate()
                .map(|(i, s)| SectionOutline {
                    id: (*s).into(),
                    order: i as u32,
                })
                .collect(),
        };
        CourseStructure {
            version: 1,
            lessons: vec![
                lesson("l1", 0, ["l1s1", "l1s2"]),
                lesson("l2", 1, ["l2s1", "l2s2"]),
            ],
        }
    }

    fn service_on(store: Arc<MemoryStorage>) -> ProgressService {
        let content = StaticContentSource::new().with_course("c", structure());
        ProgressService::new(store, Arc::new(content))
    }

    fn service() -> ProgressService {
        service_on(Arc::new(MemoryStorage::new()))
    }

    fn done(section: &str, secs: u64, device: &str) -> ProgressEvent {
        ProgressEvent::completed("st".into(), section.into(), secs, device.into())
    }

    fn student() -> StudentId {
        StudentId::new("st")
    }

    fn course() -> CourseId {
        CourseId::new("c")
    }

    #[tokio::test]
    async fn completing_first_section_unlocks_the_second() {
        let service = service();
        service.append(done("l1s1", 60, "phone")).await.unwrap();

        let snapshot = service.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot.lesson_percent[&LessonId::new("l1")], 50);
        assert_eq!(snapshot.course_percent, 25);

        let unlock = service.get_unlock_state(&student(), &course()).await.unwrap();
        assert_eq!(unlock[&SectionId::new("l1s1")], UnlockState::Completed);
        assert_eq!(unlock[&SectionId::new("l1s2")], UnlockState::Unlocked);
        assert_eq!(unlock[&SectionId::new("l2s1")], UnlockState::Locked);
        assert_eq!(unlock[&SectionId::new("l2s2")], UnlockState::Locked);
    }

    #[tokio::test]
    async fn two_devices_completing_same_section_merge() {
        let service = service();
        service.append(done("l1s1", 30, "phone")).await.unwrap();
        service.append(done("l1s1", 45, "laptop")).await.unwrap();

        let snapshot = service.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot.completed_section_ids.len(), 1);
        assert_eq!(snapshot.total_time_spent_seconds, 75);
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn redelivery_is_a_duplicate_and_not_double_counted() {
        let service = service();
        let event = done("l1s1", 30, "phone");

        assert_eq!(service.append(event.clone()).await.unwrap(), AppendOutcome::Applied);
        assert_eq!(service.append(event).await.unwrap(), AppendOutcome::Duplicate);

        let snapshot = service.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot.total_time_spent_seconds, 30);
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn unknown_section_is_a_validation_error() {
        let service = service();
        let err = service.append(done("nowhere", 0, "phone")).await.unwrap_err();
        assert!(matches!(
            err,
            ProgressError::Validation(ValidationError::UnknownSection(_))
        ));
    }

    /// Counts catalogue listings.
    struct CountingSource {
        inner: StaticContentSource,
        listings: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ContentSource for CountingSource {
        async fn get_course_structure(&self, id: &CourseId) -> Result<Option<CourseStructure>> {
            self.inner.get_course_structure(id).await
        }

        async fn list_course_ids(&self) -> Result<Vec<CourseId>> {
            self.listings.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.list_course_ids().await
        }
    }

    #[tokio::test]
    async fn unknown_sections_refresh_the_catalogue_once_per_batch() {
        let source = Arc::new(CountingSource {
            inner: StaticContentSource::new().with_course("c", structure()),
            listings: Default::default(),
        });
        let service = ProgressService::new(Arc::new(MemoryStorage::new()), source.clone());
        let listings = || source.listings.load(std::sync::atomic::Ordering::SeqCst);

        let ghosts: Vec<_> = (0..5).map(|i| done(&format!("ghost{i}"), 1, "phone")).collect();
        let mut batch = ghosts.clone();
        batch.push(done("l1s1", 10, "phone"));
        let response = service.ingest_batch(batch).await;
        assert_eq!(response.rejected.len(), 5);
        assert_eq!(response.accepted.len(), 1);
        assert_eq!(listings(), 1);

        // Each batch and each single append gets its own refresh.
        service.ingest_batch(ghosts).await;
        assert_eq!(listings(), 2);
        service.append(done("ghost", 1, "phone")).await.unwrap_err();
        assert_eq!(listings(), 3);
    }

    #[tokio::test]
    async fn section_history_lists_the_student_entries() {
        let service = service();
        let first = done("l1s1", 10, "phone");
        let second = ProgressEvent::time_spent("st".into(), "l1s1".into(), 5, "laptop".into());
        service.append(first.clone()).await.unwrap();
        service.append(done("l1s2", 10, "phone")).await.unwrap();
        service.append(second.clone()).await.unwrap();
        service.append(first.clone()).await.unwrap();

        let history = service
            .section_history(&student(), &SectionId::new("l1s1"))
            .await
            .unwrap();
        let ids: Vec<_> = history.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![first.event_id, second.event_id]);
    }

    #[tokio::test]
    async fn unknown_course_is_reported() {
        let service = service();
        let err = service
            .get_snapshot(&student(), &CourseId::new("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::UnknownCourse(_)));
    }

    #[tokio::test]
    async fn batch_accepts_valid_and_rejects_invalid_independently() {
        let service = service();
        let good = done("l1s1", 10, "phone");
        let bad = done("ghost", 10, "phone");
        let again = good.clone();

        let response = service
            .ingest_batch(vec![good.clone(), bad.clone(), again])
            .await;

        assert_eq!(response.accepted, vec![good.event_id, good.event_id]);
        assert_eq!(response.rejected.len(), 1);
        assert_eq!(response.rejected[0].event_id, bad.event_id);
        assert_eq!(response.rejected[0].reason, RejectReason::UnknownSection);
    }

    #[tokio::test]
    async fn snapshot_cache_survives_service_restart() {
        let store = Arc::new(MemoryStorage::new());
        {
            let service = service_on(store.clone());
            service.append(done("l1s1", 30, "phone")).await.unwrap();
            service.append(done("l1s2", 30, "phone")).await.unwrap();
        }

        let cached = store.load_snapshot(&student(), &course()).await.unwrap().unwrap();
        assert_eq!(cached.version, 2);

        let restarted = service_on(store);
        let snapshot = restarted.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot, cached);
        assert_eq!(
            restarted.next_section(&student(), &course()).await.unwrap(),
            Some(SectionId::new("l2s1"))
        );
    }

    #[tokio::test]
    async fn corrupt_cache_is_rebuilt_from_ledger() {
        let store = Arc::new(MemoryStorage::new());
        {
            let service = service_on(store.clone());
            service.append(done("l1s1", 30, "phone")).await.unwrap();
        }
        let mut corrupt = store.load_snapshot(&student(), &course()).await.unwrap().unwrap();
        corrupt.course_percent = 99;
        store.save_snapshot(&corrupt).await.unwrap();

        let service = service_on(store);
        let snapshot = service.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot.course_percent, 25);

        let rebuilt = service.rebuild_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(rebuilt, snapshot);
    }

    #[tokio::test]
    async fn concurrent_appends_of_one_event_apply_once() {
        let service = Arc::new(service());
        let event = done("l1s1", 30, "phone");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move { service.append(event).await }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == AppendOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let snapshot = service.get_snapshot(&student(), &course()).await.unwrap();
        assert_eq!(snapshot.total_time_spent_seconds, 30);
    }

    #[tokio::test]
    async fn position_reports_resolve_to_latest() {
        let service = service();
        service
            .report_position(&student(), &course(), &"l1s1".into(), &"phone".into())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let winner = service
            .report_position(&student(), &course(), &"l1s2".into(), &"laptop".into())
            .await
            .unwrap();

        assert_eq!(winner.section_id, SectionId::new("l1s2"));
        assert_eq!(
            service.current_position(&student(), &course()).await,
            Some(winner)
        );

        let err = service
            .report_position(&student(), &course(), &"ghost".into(), &"phone".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::Validation(_)));
    }

    #[tokio::test]
    async fn idle_contexts_are_bounded_and_reload_from_storage() {
        let content = StaticContentSource::new().with_course("c", structure());
        let config = ProgressConfig::default().with_max_contexts(2);
        let service =
            ProgressService::with_config(Arc::new(MemoryStorage::new()), Arc::new(content), config);

        for name in ["ann", "bob", "cyd"] {
            let event = ProgressEvent::completed(name.into(), "l1s1".into(), 10, "web".into());
            service.append(event).await.unwrap();
        }
        assert_eq!(service.loaded_contexts().await, 2);

        // "ann" was dropped first and comes back intact.
        let ann = StudentId::new("ann");
        let snapshot = service.get_snapshot(&ann, &course()).await.unwrap();
        assert_eq!(snapshot.course_percent, 25);
        assert_eq!(snapshot.total_time_spent_seconds, 10);
        assert_eq!(service.loaded_contexts().await, 2);

        let again = ProgressEvent::completed("ann".into(), "l1s2".into(), 5, "web".into());
        service.append(again).await.unwrap();
        let snapshot = service.get_snapshot(&ann, &course()).await.unwrap();
        assert_eq!(snapshot.course_percent, 50);
        assert_eq!(snapshot.total_time_spent_seconds, 15);
    }

    #[tokio::test]
    async fn position_register_drops_oldest_reports() {
        let content = StaticContentSource::new().with_course("c", structure());
        let config = ProgressConfig::default().with_max_positions(2);
        let service =
            ProgressService::with_config(Arc::new(MemoryStorage::new()), Arc::new(content), config);

        for name in ["ann", "bob", "cyd"] {
            service
                .report_position(&name.into(), &course(), &"l1s1".into(), &"web".into())
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(service.current_position(&"ann".into(), &course()).await, None);
        assert!(service.current_position(&"bob".into(), &course()).await.is_some());
        assert!(service.current_position(&"cyd".into(), &course()).await.is_some());
    }

    #[tokio::test]
    async fn course_percent_is_monotonic_under_mixed_events() {
        let service = service();
        let sequence = [
            ProgressEvent::time_spent("st".into(), "l2s2".into(), 4, "a".into()),
            done("l2s1", 1, "b"),
            done("l1s1", 1, "a"),
            ProgressEvent::time_spent("st".into(), "l1s1".into(), 9, "b".into()),
            done("l2s1", 2, "a"),
            done("l1s2", 1, "b"),
            done("l2s2", 1, "a"),
        ];

        let mut last = 0;
        for event in sequence {
            service.append(event).await.unwrap();
            let now = service
                .get_snapshot(&student(), &course())
                .await
                .unwrap()
                .course_percent;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 100);
    }
}
