//! Progress engine errors.

use coursetrack_core::{CourseId, EventId, HierarchyError, RejectReason, SectionId};
use coursetrack_storage::StorageError;

/// Result type for progress operations.
pub type Result<T> = std::result::Result<T, ProgressError>;

/// Reasons an event is refused at the ledger boundary.
///
/// Validation errors are synchronous and permanent: the event is never
/// recorded, and retrying it unchanged will fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Section id is not part of any known course
    #[error("unknown section: {0}")]
    UnknownSection(SectionId),

    /// Section exists, but not in the course the caller named
    #[error("section {section} is not part of course {course}")]
    SectionNotInCourse {
        /// Section id
        section: SectionId,
        /// Course the caller named
        course: CourseId,
    },

    /// Time delta is larger than any single visit can plausibly be
    #[error("event {event_id}: time delta {seconds}s exceeds {max}s")]
    ExcessiveTimeDelta {
        /// Offending event
        event_id: EventId,
        /// Delta carried by the event
        seconds: u64,
        /// Configured maximum
        max: u64,
    },
}

impl ValidationError {
    /// Wire reason reported back to sync clients.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            ValidationError::UnknownSection(_) | ValidationError::SectionNotInCourse { .. } => {
                RejectReason::UnknownSection
            }
            ValidationError::ExcessiveTimeDelta { .. } => RejectReason::InvalidEvent,
        }
    }
}

/// Errors from the progress engine.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// Event or request refused at validation
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Content collaborator does not know the course
    #[error("unknown course: {0}")]
    UnknownCourse(CourseId),

    /// Course structure violates hierarchy invariants, or clashes with an
    /// already indexed course
    #[error("invalid course content: {0}")]
    Content(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<HierarchyError> for ProgressError {
    fn from(err: HierarchyError) -> Self {
        ProgressError::Content(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_wire_reasons() {
        let unknown = ValidationError::UnknownSection("ghost".into());
        assert_eq!(unknown.reject_reason(), RejectReason::UnknownSection);

        let excessive = ValidationError::ExcessiveTimeDelta {
            event_id: EventId::new(),
            seconds: 100_000,
            max: 86_400,
        };
        assert_eq!(excessive.reject_reason(), RejectReason::InvalidEvent);
    }

    #[test]
    fn hierarchy_errors_become_content_errors() {
        let err: ProgressError = HierarchyError::EmptyCourse("c".into()).into();
        assert!(matches!(err, ProgressError::Content(msg) if msg.contains("no sections")));
    }
}
