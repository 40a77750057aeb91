//! Aggregation Engine - incremental completion and time counters.
//!
//! Section totals are fixed by the hierarchy; only completion counts and
//! time sums move. Every update is O(1): nothing is ever rescanned.

use std::collections::BTreeMap;

use coursetrack_core::{Course, SectionId};

/// Integer percentage, rounded half up.
///
/// `completed` is clamped to `total`; an empty total reads as 0.
pub fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total) as u64;
    let total = total as u64;
    ((200 * completed + total) / (2 * total)) as u8
}

/// Completion and time counters for one student in one course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregates {
    lesson_completed: Vec<usize>,
    lesson_totals: Vec<usize>,
    course_completed: usize,
    course_total: usize,
    total_time_spent_seconds: u64,
    section_time_spent: BTreeMap<SectionId, u64>,
}

impl Aggregates {
    /// Zeroed counters sized from the course hierarchy.
    pub fn new(course: &Course) -> Self {
        let lesson_totals: Vec<usize> = course.lessons.iter().map(|l| l.sections.len()).collect();
        Self {
            lesson_completed: vec![0; lesson_totals.len()],
            course_total: lesson_totals.iter().sum(),
            lesson_totals,
            course_completed: 0,
            total_time_spent_seconds: 0,
            section_time_spent: BTreeMap::new(),
        }
    }

    /// Count a section flipping from incomplete to complete.
    ///
    /// Callers must only report each section once.
    pub fn record_completion(&mut self, lesson_index: usize) {
        if let Some(count) = self.lesson_completed.get_mut(lesson_index) {
            *count += 1;
            self.course_completed += 1;
        }
    }

    /// Add a time delta for a section.
    pub fn record_time(&mut self, section: &SectionId, seconds: u64) {
        if seconds == 0 {
            return;
        }
        self.total_time_spent_seconds = self.total_time_spent_seconds.saturating_add(seconds);
        let entry = self.section_time_spent.entry(section.clone()).or_insert(0);
        *entry = entry.saturating_add(seconds);
    }

    /// Completion of one lesson, 0..=100.
    pub fn lesson_percent(&self, lesson_index: usize) -> u8 {
        match (
            self.lesson_completed.get(lesson_index),
            self.lesson_totals.get(lesson_index),
        ) {
            (Some(done), Some(total)) => percent(*done, *total),
            _ => 0,
        }
    }

    /// Completion of the course, 0..=100. Every section weighs the same.
    pub fn course_percent(&self) -> u8 {
        percent(self.course_completed, self.course_total)
    }

    /// Completed sections in the course.
    pub fn course_completed(&self) -> usize {
        self.course_completed
    }

    /// Sections in the course.
    pub fn course_total(&self) -> usize {
        self.course_total
    }

    /// Sum of all time deltas.
    pub fn total_time_spent_seconds(&self) -> u64 {
        self.total_time_spent_seconds
    }

    /// Time deltas per section.
    pub fn section_time_spent(&self) -> &BTreeMap<SectionId, u64> {
        &self.section_time_spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{CourseStructure, LessonOutline, SectionOutline};

    fn course(lesson_sizes: &[usize]) -> Course {
        let lessons = lesson_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| LessonOutline {
                id: format!("l{i}").into(),
                order: i as u32,
                sections: (0..*size)
                    .map(|j| SectionOutline {
                        id: format!("l{i}s{j}").into(),
                        order: j as u32,
                    })
                    .collect(),
            })
            .collect();
        Course::from_structure("c".into(), CourseStructure { version: 1, lessons }).unwrap()
    }

    #[test]
    fn percent_rounds_half_up() {
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(1, 8), 13);
        assert_eq!(percent(1, 200), 1);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
        assert_eq!(percent(0, 0), 0);
    }

    #[test]
    fn course_percent_weights_sections_not_lessons() {
        let mut agg = Aggregates::new(&course(&[1, 3]));
        agg.record_completion(0);

        assert_eq!(agg.lesson_percent(0), 100);
        assert_eq!(agg.lesson_percent(1), 0);
        assert_eq!(agg.course_percent(), 25);
        assert_eq!(agg.course_total(), 4);
    }

    #[test]
    fn course_percent_never_decreases() {
        let mut agg = Aggregates::new(&course(&[3, 4, 2]));
        let mut last = agg.course_percent();
        for lesson in [1, 0, 2, 1, 1, 0, 2, 0, 1] {
            agg.record_completion(lesson);
            let now = agg.course_percent();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn time_is_summed_per_section_and_overall() {
        let mut agg = Aggregates::new(&course(&[2]));
        agg.record_time(&"l0s0".into(), 30);
        agg.record_time(&"l0s0".into(), 45);
        agg.record_time(&"l0s1".into(), 0);

        assert_eq!(agg.total_time_spent_seconds(), 75);
        assert_eq!(agg.section_time_spent().get(&SectionId::new("l0s0")), Some(&75));
        assert!(!agg.section_time_spent().contains_key(&SectionId::new("l0s1")));
    }
}
