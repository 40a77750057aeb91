//! Derived progress views: snapshots and unlock states.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::hierarchy::Course;
use crate::id::{CourseId, LessonId, SectionId, StudentId};
use crate::Time;

/// Aggregated progress for one student in one course.
///
/// Snapshots are caches: they can always be rebuilt from the ledger and are
/// never edited by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Learner
    pub student_id: StudentId,

    /// Course
    pub course_id: CourseId,

    /// Sections with at least one completion event
    pub completed_section_ids: BTreeSet<SectionId>,

    /// Completion per lesson, 0..=100
    pub lesson_percent: BTreeMap<LessonId, u8>,

    /// Completion for the course, 0..=100 (section-count weighted)
    pub course_percent: u8,

    /// Sum of time deltas over distinct events
    pub total_time_spent_seconds: u64,

    /// Time deltas per section
    #[serde(default)]
    pub section_time_spent: BTreeMap<SectionId, u64>,

    /// Server timestamp of the latest applied event
    #[serde(default)]
    pub last_activity_at: Option<Time>,

    /// Bumped on every applied event
    pub version: u64,
}

impl ProgressSnapshot {
    /// Snapshot of a student who has not started the course.
    pub fn empty(student_id: StudentId, course: &Course) -> Self {
        Self {
            student_id,
            course_id: course.id.clone(),
            completed_section_ids: BTreeSet::new(),
            lesson_percent: course.lessons.iter().map(|l| (l.id.clone(), 0)).collect(),
            course_percent: 0,
            total_time_spent_seconds: 0,
            section_time_spent: BTreeMap::new(),
            last_activity_at: None,
            version: 0,
        }
    }

    /// Whether the learner has completed a section.
    pub fn is_completed(&self, section_id: &SectionId) -> bool {
        self.completed_section_ids.contains(section_id)
    }
}

/// Accessibility of a section.
///
/// Ordered so that `Locked < Unlocked < Completed`; transitions only move up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnlockState {
    /// Not reachable yet
    Locked,
    /// Reachable, not completed
    Unlocked,
    /// Completed (terminal)
    Completed,
}

impl UnlockState {
    /// Whether the learner may open the section.
    pub fn is_accessible(self) -> bool {
        !matches!(self, UnlockState::Locked)
    }
}

/// Unlock state for every section of a course.
pub type UnlockMap = BTreeMap<SectionId, UnlockState>;
