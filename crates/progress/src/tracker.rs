//! Progress tracking contract exposed to transports and the HTTP layer.

use async_trait::async_trait;
use coursetrack_core::{
    AppendOutcome, CourseId, CourseStructure, ProgressEvent, ProgressSnapshot, StudentId,
    SyncBatchResponse, UnlockMap,
};

use crate::error::Result;

/// Server-side progress operations.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Append one event to the ledger.
    async fn submit(&self, event: ProgressEvent) -> Result<AppendOutcome>;

    /// Append a sync batch, validating each event independently.
    async fn ingest_batch(&self, events: Vec<ProgressEvent>) -> SyncBatchResponse;

    /// Canonical snapshot for a student and course.
    async fn get_snapshot(&self, student: &StudentId, course: &CourseId) -> Result<ProgressSnapshot>;

    /// Unlock state of every section of a course.
    async fn get_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap>;

    /// Course structure as currently indexed.
    async fn get_course_structure(&self, course: &CourseId) -> Result<CourseStructure>;
}
