//! Storage trait abstraction.

use async_trait::async_trait;
use coursetrack_core::{
    Course, CourseId, EventId, ProgressEvent, ProgressSnapshot, SectionId, StudentId,
    SyncQueueEntry,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error (database driver errors end up here)
    #[error("{0}")]
    Other(String),
}

/// Result of inserting an event into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this event id was seen
    Inserted,
    /// An event with this id already exists; nothing was written
    AlreadyPresent,
}

/// Append-only ledger of progress events plus the derived snapshot cache.
///
/// `insert_event` must be atomic on the event id: two concurrent inserts of
/// the same id yield exactly one `Inserted`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // === Ledger operations ===

    /// Insert an event unless its id is already present.
    async fn insert_event(&self, event: &ProgressEvent) -> Result<InsertOutcome>;

    /// Load an event by id.
    async fn load_event(&self, id: EventId) -> Result<Option<ProgressEvent>>;

    /// All events of a student, in ingestion order.
    async fn list_student_events(&self, student: &StudentId) -> Result<Vec<ProgressEvent>>;

    /// Events of a student for one section, in ingestion order.
    async fn list_section_events(
        &self,
        student: &StudentId,
        section: &SectionId,
    ) -> Result<Vec<ProgressEvent>>;

    // === Snapshot cache ===

    /// Save (replace) the cached snapshot for a student and course.
    async fn save_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<()>;

    /// Load the cached snapshot for a student and course.
    async fn load_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<Option<ProgressSnapshot>>;

    /// Drop the cached snapshot; it will be rebuilt from the ledger.
    async fn delete_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<()>;

    /// Check the backend is reachable.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Local store of imported course structures.
#[async_trait]
pub trait CourseStore: Send + Sync {
    /// Save (replace) a course.
    async fn save_course(&self, course: &Course) -> Result<()>;

    /// Load a course by id.
    async fn load_course(&self, id: &CourseId) -> Result<Option<Course>>;

    /// List all stored courses.
    async fn list_courses(&self) -> Result<Vec<Course>>;
}

/// Client-side persistence for the offline sync queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Replace the persisted queue with `entries` (in FIFO order).
    async fn save_queue(&self, entries: &[SyncQueueEntry]) -> Result<()>;

    /// Load the persisted queue in FIFO order.
    async fn load_queue(&self) -> Result<Vec<SyncQueueEntry>>;
}
