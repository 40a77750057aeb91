//! Per student-course progress context.
//!
//! [`CourseProgress`] is threaded explicitly through aggregation and the
//! unlock gate; there is no shared global state. The service owns one
//! context per `(student, course)` and serializes writes to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use coursetrack_core::{
    Course, CourseId, ProgressEvent, ProgressSnapshot, SectionId, StudentId, Time, UnlockMap,
    UnlockState,
};
use tracing::debug;

use crate::aggregation::Aggregates;
use crate::unlock::UnlockGate;

/// Effect of applying one event to a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyEffect {
    /// The section flipped from incomplete to complete
    pub newly_completed: bool,

    /// Seconds added to the time totals
    pub time_added: u64,
}

/// Derived progress of one student in one course.
#[derive(Debug, Clone)]
pub struct CourseProgress {
    student_id: StudentId,
    course: Arc<Course>,
    /// section -> (lesson index, global index)
    positions: HashMap<SectionId, (usize, usize)>,
    aggregates: Aggregates,
    gate: UnlockGate,
    last_activity_at: Option<Time>,
    version: u64,
}

impl CourseProgress {
    /// Fresh context: nothing completed, first section unlocked.
    pub fn new(student_id: StudentId, course: Arc<Course>) -> Self {
        let mut positions = HashMap::new();
        let mut global = 0;
        for (lesson_index, lesson) in course.lessons.iter().enumerate() {
            for section in &lesson.sections {
                positions.insert(section.id.clone(), (lesson_index, global));
                global += 1;
            }
        }

        Self {
            student_id,
            aggregates: Aggregates::new(&course),
            gate: UnlockGate::new(global),
            positions,
            course,
            last_activity_at: None,
            version: 0,
        }
    }

    /// Rebuild by replaying ledger events in ingestion order.
    ///
    /// Events for sections outside the course are skipped.
    pub fn replay<'a>(
        student_id: StudentId,
        course: Arc<Course>,
        events: impl IntoIterator<Item = &'a ProgressEvent>,
    ) -> Self {
        let mut progress = Self::new(student_id, course);
        for event in events {
            progress.apply(event);
        }
        progress
    }

    /// Restore from a cached snapshot.
    ///
    /// Returns `None` when the snapshot does not fit the course (different
    /// student or course, unknown sections or lessons), in which case the
    /// caller must rebuild from the ledger.
    pub fn from_snapshot(snapshot: &ProgressSnapshot, course: Arc<Course>) -> Option<Self> {
        if snapshot.course_id != course.id {
            return None;
        }
        if snapshot.lesson_percent.len() != course.lessons.len()
            || course
                .lessons
                .iter()
                .any(|l| !snapshot.lesson_percent.contains_key(&l.id))
        {
            return None;
        }

        let mut progress = Self::new(snapshot.student_id.clone(), course);
        for section in &snapshot.completed_section_ids {
            let (lesson_index, global_index) = *progress.positions.get(section)?;
            if progress.gate.mark_completed(global_index) {
                progress.aggregates.record_completion(lesson_index);
            }
        }
        for (section, seconds) in &snapshot.section_time_spent {
            if !progress.positions.contains_key(section) {
                return None;
            }
            progress.aggregates.record_time(section, *seconds);
        }
        if progress.aggregates.total_time_spent_seconds() != snapshot.total_time_spent_seconds {
            return None;
        }
        progress.last_activity_at = snapshot.last_activity_at;
        progress.version = snapshot.version;

        if progress.snapshot() != *snapshot {
            return None;
        }
        Some(progress)
    }

    /// Apply one ledger event.
    ///
    /// Must be called at most once per event id; the ledger guarantees this.
    pub fn apply(&mut self, event: &ProgressEvent) -> ApplyEffect {
        let Some(&(lesson_index, global_index)) = self.positions.get(&event.section_id) else {
            debug!(
                section_id = %event.section_id,
                course_id = %self.course.id,
                "Skipping event outside course"
            );
            return ApplyEffect {
                newly_completed: false,
                time_added: 0,
            };
        };

        let newly_completed = event.is_completion() && self.gate.mark_completed(global_index);
        if newly_completed {
            self.aggregates.record_completion(lesson_index);
        }
        self.aggregates
            .record_time(&event.section_id, event.time_spent_delta_seconds);

        if let Some(at) = event.server_timestamp {
            self.last_activity_at = Some(self.last_activity_at.map_or(at, |prev| prev.max(at)));
        }
        self.version += 1;

        ApplyEffect {
            newly_completed,
            time_added: event.time_spent_delta_seconds,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed_section_ids = self
            .course
            .sections()
            .enumerate()
            .filter(|(i, _)| self.gate.is_recorded(*i))
            .map(|(_, s)| s.id.clone())
            .collect();

        let lesson_percent: BTreeMap<_, _> = self
            .course
            .lessons
            .iter()
            .enumerate()
            .map(|(i, l)| (l.id.clone(), self.aggregates.lesson_percent(i)))
            .collect();

        ProgressSnapshot {
            student_id: self.student_id.clone(),
            course_id: self.course.id.clone(),
            completed_section_ids,
            lesson_percent,
            course_percent: self.aggregates.course_percent(),
            total_time_spent_seconds: self.aggregates.total_time_spent_seconds(),
            section_time_spent: self.aggregates.section_time_spent().clone(),
            last_activity_at: self.last_activity_at,
            version: self.version,
        }
    }

    /// Unlock state of every section.
    pub fn unlock_map(&self) -> UnlockMap {
        self.gate.unlock_map(&self.course)
    }

    /// Unlock state of one section, `None` if it is not in the course.
    pub fn state_of(&self, section: &SectionId) -> Option<UnlockState> {
        self.positions
            .get(section)
            .map(|(_, global)| self.gate.state(*global))
    }

    /// The unlocked, not yet completed section to resume at.
    ///
    /// `None` once every section is completed.
    pub fn next_section(&self) -> Option<&SectionId> {
        self.course
            .sections()
            .nth(self.gate.frontier())
            .map(|s| &s.id)
    }

    /// The course this context tracks.
    pub fn course(&self) -> &Arc<Course> {
        &self.course
    }

    /// Course id.
    pub fn course_id(&self) -> &CourseId {
        &self.course.id
    }

    /// Student id.
    pub fn student_id(&self) -> &StudentId {
        &self.student_id
    }

    /// Number of events applied.
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{CourseStructure, LessonId, LessonOutline, SectionOutline};

    /// 2 lessons x 2 sections: l1/{s1,s2}, l2/{s3,s4}.
    fn course() -> Arc<Course> {
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
        let structure = CourseStructure {
            version: 1,
            lessons: vec![lesson("l1", 0, ["s1", "s2"]), lesson("l2", 1, ["s3", "s4"])],
        };
        Arc::new(Course::from_structure("c".into(), structure).unwrap())
    }

    fn done(section: &str, secs: u64) -> ProgressEvent {
        let mut e = ProgressEvent::completed("st".into(), section.into(), secs, "d".into());
        e.server_timestamp = Some(chrono::Utc::now());
        e
    }

    fn visit(section: &str, secs: u64) -> ProgressEvent {
        let mut e = ProgressEvent::time_spent("st".into(), section.into(), secs, "d".into());
        e.server_timestamp = Some(chrono::Utc::now());
        e
    }

    #[test]
    fn completing_first_section_matches_expected_aggregates() {
        let mut progress = CourseProgress::new("st".into(), course());
        let effect = progress.apply(&done("s1", 60));
        assert!(effect.newly_completed);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.lesson_percent[&LessonId::new("l1")], 50);
        assert_eq!(snapshot.lesson_percent[&LessonId::new("l2")], 0);
        assert_eq!(snapshot.course_percent, 25);
        assert_eq!(snapshot.version, 1);

        let unlock = progress.unlock_map();
        assert_eq!(unlock[&SectionId::new("s1")], UnlockState::Completed);
        assert_eq!(unlock[&SectionId::new("s2")], UnlockState::Unlocked);
        assert_eq!(unlock[&SectionId::new("s3")], UnlockState::Locked);
        assert_eq!(unlock[&SectionId::new("s4")], UnlockState::Locked);
    }

    #[test]
    fn repeated_completion_counts_once_but_adds_time() {
        let mut progress = CourseProgress::new("st".into(), course());
        progress.apply(&done("s1", 30));
        let effect = progress.apply(&done("s1", 45));

        assert!(!effect.newly_completed);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.completed_section_ids.len(), 1);
        assert_eq!(snapshot.total_time_spent_seconds, 75);
        assert_eq!(snapshot.course_percent, 25);
    }

    #[test]
    fn any_order_yields_same_completion_and_time() {
        let events = vec![
            done("s3", 10),
            visit("s1", 5),
            done("s1", 20),
            done("s2", 15),
            visit("s3", 7),
            done("s1", 1),
        ];

        let forward = CourseProgress::replay("st".into(), course(), &events).snapshot();
        let backward = CourseProgress::replay("st".into(), course(), events.iter().rev()).snapshot();
        let mut rotated = events.clone();
        rotated.rotate_left(2);
        let rotated = CourseProgress::replay("st".into(), course(), &rotated).snapshot();

        for other in [&backward, &rotated] {
            assert_eq!(forward.completed_section_ids, other.completed_section_ids);
            assert_eq!(forward.total_time_spent_seconds, other.total_time_spent_seconds);
            assert_eq!(forward.section_time_spent, other.section_time_spent);
            assert_eq!(forward.course_percent, other.course_percent);
        }
        assert_eq!(forward.total_time_spent_seconds, 58);
    }

    #[test]
    fn out_of_order_completion_counts_but_stays_locked() {
        let mut progress = CourseProgress::new("st".into(), course());
        progress.apply(&done("s3", 0));

        assert_eq!(progress.snapshot().course_percent, 25);
        assert_eq!(progress.state_of(&"s3".into()), Some(UnlockState::Locked));
        assert_eq!(progress.next_section(), Some(&SectionId::new("s1")));

        progress.apply(&done("s1", 0));
        progress.apply(&done("s2", 0));
        assert_eq!(progress.state_of(&"s3".into()), Some(UnlockState::Completed));
        assert_eq!(progress.next_section(), Some(&SectionId::new("s4")));
    }

    #[test]
    fn events_outside_course_are_ignored() {
        let mut progress = CourseProgress::new("st".into(), course());
        let effect = progress.apply(&done("elsewhere", 99));
        assert_eq!(effect.time_added, 0);
        assert_eq!(progress.version(), 0);
    }

    #[test]
    fn snapshot_restores_identical_context() {
        let events = vec![done("s1", 30), visit("s2", 12), done("s3", 4)];
        let original = CourseProgress::replay("st".into(), course(), &events);
        let snapshot = original.snapshot();

        let restored = CourseProgress::from_snapshot(&snapshot, course()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.unlock_map(), original.unlock_map());
    }

    #[test]
    fn snapshot_for_other_hierarchy_is_refused() {
        let mut snapshot = CourseProgress::new("st".into(), course()).snapshot();
        snapshot.completed_section_ids.insert("removed".into());
        assert!(CourseProgress::from_snapshot(&snapshot, course()).is_none());

        let mut snapshot = CourseProgress::new("st".into(), course()).snapshot();
        snapshot.course_percent = 80;
        assert!(CourseProgress::from_snapshot(&snapshot, course()).is_none());
    }

    #[test]
    fn finished_course_has_no_next_section() {
        let events: Vec<_> = ["s1", "s2", "s3", "s4"].iter().map(|s| done(s, 0)).collect();
        let progress = CourseProgress::replay("st".into(), course(), &events);
        assert_eq!(progress.snapshot().course_percent, 100);
        assert!(progress.next_section().is_none());
    }
}
