//! Prefetch planning.

use std::collections::BTreeSet;

use coursetrack_core::{Course, CourseId, ProgressSnapshot, SectionId, UnlockMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Planner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Upcoming sections to prefetch
    pub lookahead: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { lookahead: 2 }
    }
}

impl PlannerConfig {
    /// Set the lookahead.
    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead;
        self
    }
}

/// What to fetch and what to protect for one position in a course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPlan {
    /// Course being studied
    pub course_id: CourseId,

    /// Section the learner is on
    pub current: SectionId,

    /// Upcoming accessible sections, in hierarchy order
    pub prefetch: Vec<SectionId>,

    /// Visited sections plus the prefetch set, protected from eviction
    pub pinned: BTreeSet<SectionId>,
}

/// Chooses which sections to warm next.
#[derive(Debug, Clone, Default)]
pub struct PrefetchPlanner {
    config: PlannerConfig,
}

impl PrefetchPlanner {
    /// Create a planner.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plan for a learner positioned at `current`.
    ///
    /// Walks forward from `current` in hierarchy order, taking up to
    /// `lookahead` accessible sections and stopping at the first locked one.
    /// Sections the learner has completed or spent time in count as visited.
    pub fn plan(
        &self,
        course: &Course,
        snapshot: &ProgressSnapshot,
        unlock: &UnlockMap,
        current: &SectionId,
    ) -> Result<PrefetchPlan> {
        let ordered: Vec<&SectionId> = course.sections().map(|s| &s.id).collect();
        let position = ordered
            .iter()
            .position(|id| *id == current)
            .ok_or_else(|| CacheError::UnknownSection {
                section: current.clone(),
                course: course.id.clone(),
            })?;

        let prefetch: Vec<SectionId> = ordered[position + 1..]
            .iter()
            .take_while(|id| unlock.get(**id).is_some_and(|state| state.is_accessible()))
            .take(self.config.lookahead)
            .map(|id| (*id).clone())
            .collect();

        let visited = ordered.iter().filter(|id| {
            snapshot.is_completed(id) || snapshot.section_time_spent.contains_key(**id)
        });
        let pinned: BTreeSet<SectionId> = visited
            .map(|id| (*id).clone())
            .chain(std::iter::once(current.clone()))
            .chain(prefetch.iter().cloned())
            .collect();

        debug!(
            course = %course.id,
            current = %current,
            prefetch = prefetch.len(),
            pinned = pinned.len(),
            "Prefetch planned"
        );
        Ok(PrefetchPlan {
            course_id: course.id.clone(),
            current: current.clone(),
            prefetch,
            pinned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{CourseStructure, LessonOutline, SectionOutline, UnlockState};

    fn course() -> Course {
        let lesson = |id: &str, order: u32| LessonOutline {
            id: id.into(),
            order,
            sections: (1..=3)
                .map(|i| SectionOutline {
                    id: format!("{id}s{i}").into(),
                    order: i,
                })
                .collect(),
        };
        let structure = CourseStructure {
            version: 1,
            lessons: vec![lesson("l1", 1), lesson("l2", 2)],
        };
        Course::from_structure(CourseId::new("c"), structure).unwrap()
    }

    fn unlock(course: &Course, accessible: usize) -> UnlockMap {
        course
            .sections()
            .enumerate()
            .map(|(i, s)| {
                let state = if i < accessible {
                    UnlockState::Unlocked
                } else {
                    UnlockState::Locked
                };
                (s.id.clone(), state)
            })
            .collect()
    }

    fn ids(ids: &[&str]) -> Vec<SectionId> {
        ids.iter().map(|id| SectionId::new(*id)).collect()
    }

    #[test]
    fn prefetches_next_two_across_lessons() {
        let course = course();
        let snapshot = ProgressSnapshot::empty("st".into(), &course);
        let plan = PrefetchPlanner::default()
            .plan(&course, &snapshot, &unlock(&course, 6), &SectionId::new("l1s2"))
            .unwrap();
        assert_eq!(plan.prefetch, ids(&["l1s3", "l2s1"]));
        assert!(plan.pinned.contains(&SectionId::new("l1s2")));
    }

    #[test]
    fn stops_at_first_locked_section() {
        let course = course();
        let snapshot = ProgressSnapshot::empty("st".into(), &course);
        let plan = PrefetchPlanner::default()
            .plan(&course, &snapshot, &unlock(&course, 2), &SectionId::new("l1s1"))
            .unwrap();
        assert_eq!(plan.prefetch, ids(&["l1s2"]));
    }

    #[test]
    fn pins_visited_sections() {
        let course = course();
        let mut snapshot = ProgressSnapshot::empty("st".into(), &course);
        snapshot.completed_section_ids.insert(SectionId::new("l1s1"));
        snapshot.section_time_spent.insert(SectionId::new("l1s2"), 30);

        let plan = PrefetchPlanner::new(PlannerConfig::default().with_lookahead(1))
            .plan(&course, &snapshot, &unlock(&course, 6), &SectionId::new("l1s3"))
            .unwrap();
        let pinned: Vec<SectionId> = plan.pinned.into_iter().collect();
        assert_eq!(pinned, ids(&["l1s1", "l1s2", "l1s3", "l2s1"]));
    }

    #[test]
    fn unknown_current_section_is_an_error() {
        let course = course();
        let snapshot = ProgressSnapshot::empty("st".into(), &course);
        let err = PrefetchPlanner::default()
            .plan(&course, &snapshot, &unlock(&course, 6), &SectionId::new("nope"))
            .unwrap_err();
        assert!(matches!(err, CacheError::UnknownSection { .. }));
    }
}
