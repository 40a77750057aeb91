//! Progress events - immutable facts appended to the ledger.

use serde::{Deserialize, Serialize};

use crate::id::{DeviceId, EventId, SectionId, StudentId};
use crate::Time;

/// What a progress event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressKind {
    /// The learner finished the section (may also carry time spent)
    SectionCompleted,
    /// Pure time-tracking delta from a visit or revisit
    TimeSpentUpdate,
}

/// An immutable, append-only progress fact.
///
/// Events are minted on the client, deduplicated by `event_id` on the
/// server, and never mutated afterwards. The only field the server fills in
/// is `server_timestamp`, stamped at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Idempotency key
    pub event_id: EventId,

    /// Learner
    pub student_id: StudentId,

    /// Section the event refers to
    pub section_id: SectionId,

    /// Completion or time-only
    pub kind: ProgressKind,

    /// Seconds spent in the section since the previous event from this device
    pub time_spent_delta_seconds: u64,

    /// Device clock at creation (informational only)
    pub client_timestamp: Time,

    /// Originating device
    pub device_id: DeviceId,

    /// Assigned by the ledger on first ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<Time>,
}

impl ProgressEvent {
    /// Create a new event stamped with the current client time.
    pub fn new(
        student_id: StudentId,
        section_id: SectionId,
        kind: ProgressKind,
        time_spent_delta_seconds: u64,
        device_id: DeviceId,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            student_id,
            section_id,
            kind,
            time_spent_delta_seconds,
            client_timestamp: chrono::Utc::now(),
            device_id,
            server_timestamp: None,
        }
    }

    /// A completion event.
    pub fn completed(
        student_id: StudentId,
        section_id: SectionId,
        time_spent_delta_seconds: u64,
        device_id: DeviceId,
    ) -> Self {
        Self::new(
            student_id,
            section_id,
            ProgressKind::SectionCompleted,
            time_spent_delta_seconds,
            device_id,
        )
    }

    /// A time-only event.
    pub fn time_spent(
        student_id: StudentId,
        section_id: SectionId,
        time_spent_delta_seconds: u64,
        device_id: DeviceId,
    ) -> Self {
        Self::new(
            student_id,
            section_id,
            ProgressKind::TimeSpentUpdate,
            time_spent_delta_seconds,
            device_id,
        )
    }

    /// Whether this event marks the section completed.
    pub fn is_completion(&self) -> bool {
        self.kind == ProgressKind::SectionCompleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        let done = ProgressEvent::completed("st".into(), "s1".into(), 30, "phone".into());
        let visit = ProgressEvent::time_spent("st".into(), "s1".into(), 5, "phone".into());

        assert!(done.is_completion());
        assert!(!visit.is_completion());
        assert_ne!(done.event_id, visit.event_id);
        assert!(done.server_timestamp.is_none());
    }
}
