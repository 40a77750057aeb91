//! Current position - the one ephemeral field that needs a tie-break.
//!
//! Completion and time spent merge without conflicts. "Where the learner
//! currently is" does not: two devices can report different sections. The
//! latest server timestamp wins; equal timestamps fall back to comparing
//! device ids so every replica picks the same winner.

use serde::{Deserialize, Serialize};

use crate::id::{CourseId, DeviceId, SectionId, StudentId};
use crate::Time;

/// Last known position of a learner in a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPosition {
    /// Learner
    pub student_id: StudentId,

    /// Course
    pub course_id: CourseId,

    /// Section being viewed
    pub section_id: SectionId,

    /// Reporting device
    pub device_id: DeviceId,

    /// Stamped by the server at ingestion, never by the client
    pub server_timestamp: Time,
}

impl CurrentPosition {
    /// Whether `self` wins over `other`.
    pub fn supersedes(&self, other: &CurrentPosition) -> bool {
        (self.server_timestamp, &self.device_id) > (other.server_timestamp, &other.device_id)
    }

    /// Pick the winner between two reports. Commutative.
    pub fn resolve(a: CurrentPosition, b: CurrentPosition) -> CurrentPosition {
        if b.supersedes(&a) {
            b
        } else {
            a
        }
    }
}
