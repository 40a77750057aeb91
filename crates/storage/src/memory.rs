//! In-memory storage, used by tests and by clients without a data dir.

use std::collections::HashMap;

use async_trait::async_trait;
use coursetrack_core::{
    Course, CourseId, EventId, ProgressEvent, ProgressSnapshot, SectionId, StudentId,
    SyncQueueEntry,
};
use tokio::sync::RwLock;

use super::{CourseStore, InsertOutcome, LedgerStore, QueueStore, Result};

#[derive(Default)]
struct Tables {
    /// Events in ingestion order
    events: Vec<ProgressEvent>,
    /// event id -> index into `events`
    by_id: HashMap<EventId, usize>,
    snapshots: HashMap<(StudentId, CourseId), ProgressSnapshot>,
    courses: HashMap<CourseId, Course>,
    queue: Vec<SyncQueueEntry>,
}

/// Memory-backed implementation of every storage trait.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger events.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStorage {
    async fn insert_event(&self, event: &ProgressEvent) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        if tables.by_id.contains_key(&event.event_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        let index = tables.events.len();
        tables.events.push(event.clone());
        tables.by_id.insert(event.event_id, index);
        Ok(InsertOutcome::Inserted)
    }

    async fn load_event(&self, id: EventId) -> Result<Option<ProgressEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.by_id.get(&id).map(|i| tables.events[*i].clone()))
    }

    async fn list_student_events(&self, student: &StudentId) -> Result<Vec<ProgressEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| &e.student_id == student)
            .cloned()
            .collect())
    }

    async fn list_section_events(
        &self,
        student: &StudentId,
        section: &SectionId,
    ) -> Result<Vec<ProgressEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| &e.student_id == student && &e.section_id == section)
            .cloned()
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let key = (snapshot.student_id.clone(), snapshot.course_id.clone());
        self.tables.write().await.snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<Option<ProgressSnapshot>> {
        let key = (student.clone(), course.clone());
        Ok(self.tables.read().await.snapshots.get(&key).cloned())
    }

    async fn delete_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<()> {
        let key = (student.clone(), course.clone());
        self.tables.write().await.snapshots.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl CourseStore for MemoryStorage {
    async fn save_course(&self, course: &Course) -> Result<()> {
        self.tables
            .write()
            .await
            .courses
            .insert(course.id.clone(), course.clone());
        Ok(())
    }

    async fn load_course(&self, id: &CourseId) -> Result<Option<Course>> {
        Ok(self.tables.read().await.courses.get(id).cloned())
    }

    async fn list_courses(&self) -> Result<Vec<Course>> {
        let mut courses: Vec<Course> = self.tables.read().await.courses.values().cloned().collect();
        courses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(courses)
    }
}

#[async_trait]
impl QueueStore for MemoryStorage {
    async fn save_queue(&self, entries: &[SyncQueueEntry]) -> Result<()> {
        self.tables.write().await.queue = entries.to_vec();
        Ok(())
    }

    async fn load_queue(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(self.tables.read().await.queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(student: &str, section: &str) -> ProgressEvent {
        ProgressEvent::completed(student.into(), section.into(), 10, "d".into())
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_event_id() {
        let storage = MemoryStorage::new();
        let e = event("st", "s1");

        assert_eq!(storage.insert_event(&e).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(storage.insert_event(&e).await.unwrap(), InsertOutcome::AlreadyPresent);
        assert_eq!(storage.event_count().await, 1);
        assert_eq!(storage.load_event(e.event_id).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn lists_filter_by_student_and_section() {
        let storage = MemoryStorage::new();
        storage.insert_event(&event("a", "s1")).await.unwrap();
        storage.insert_event(&event("a", "s2")).await.unwrap();
        storage.insert_event(&event("b", "s1")).await.unwrap();

        let student_a: StudentId = "a".into();
        assert_eq!(storage.list_student_events(&student_a).await.unwrap().len(), 2);
        assert_eq!(
            storage
                .list_section_events(&student_a, &"s1".into())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn queue_round_trips_in_order() {
        let storage = MemoryStorage::new();
        let now = chrono::Utc::now();
        let entries = vec![
            SyncQueueEntry::new(event("a", "s1"), now),
            SyncQueueEntry::new(event("a", "s2"), now),
        ];
        storage.save_queue(&entries).await.unwrap();
        assert_eq!(storage.load_queue().await.unwrap(), entries);
    }
}
