//! Unlock Gate - sequential accessibility of sections.
//!
//! The gate tracks which sections (by global course index) are complete and
//! the frontier: the length of the completed prefix. Sections before the
//! frontier are `Completed`, the one at the frontier is `Unlocked`, and
//! everything after it is `Locked`. A completion recorded past the frontier
//! is remembered but reads `Locked` until its predecessors are done; the
//! frontier then jumps over it. The frontier never moves back, so no section
//! is ever re-locked.

use coursetrack_core::{Course, UnlockMap, UnlockState};

/// Per student-course unlock state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockGate {
    completed: Vec<bool>,
    frontier: usize,
}

impl UnlockGate {
    /// Gate for a course of `section_count` sections, nothing completed.
    pub fn new(section_count: usize) -> Self {
        Self {
            completed: vec![false; section_count],
            frontier: 0,
        }
    }

    /// Record a completion. Returns `true` if the section was not already
    /// recorded as complete.
    pub fn mark_completed(&mut self, global_index: usize) -> bool {
        let Some(slot) = self.completed.get_mut(global_index) else {
            return false;
        };
        if *slot {
            return false;
        }
        *slot = true;
        while self.completed.get(self.frontier).copied().unwrap_or(false) {
            self.frontier += 1;
        }
        true
    }

    /// Whether a completion has been recorded, regardless of the frontier.
    pub fn is_recorded(&self, global_index: usize) -> bool {
        self.completed.get(global_index).copied().unwrap_or(false)
    }

    /// Index of the first section that is not completed, or the section
    /// count once the course is done.
    pub fn frontier(&self) -> usize {
        self.frontier
    }

    /// State of one section.
    pub fn state(&self, global_index: usize) -> UnlockState {
        if global_index < self.frontier {
            UnlockState::Completed
        } else if global_index == self.frontier {
            UnlockState::Unlocked
        } else {
            UnlockState::Locked
        }
    }

    /// States of every section of `course`.
    pub fn unlock_map(&self, course: &Course) -> UnlockMap {
        course
            .sections()
            .enumerate()
            .map(|(i, section)| (section.id.clone(), self.state(i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(gate: &UnlockGate, n: usize) -> Vec<UnlockState> {
        (0..n).map(|i| gate.state(i)).collect()
    }

    #[test]
    fn first_section_starts_unlocked() {
        let gate = UnlockGate::new(3);
        assert_eq!(
            states(&gate, 3),
            vec![UnlockState::Unlocked, UnlockState::Locked, UnlockState::Locked]
        );
    }

    #[test]
    fn completion_unlocks_the_next_section() {
        let mut gate = UnlockGate::new(3);
        assert!(gate.mark_completed(0));
        assert_eq!(
            states(&gate, 3),
            vec![UnlockState::Completed, UnlockState::Unlocked, UnlockState::Locked]
        );
        assert!(!gate.mark_completed(0));
    }

    #[test]
    fn out_of_order_completion_waits_for_its_prefix() {
        let mut gate = UnlockGate::new(4);
        gate.mark_completed(2);
        assert!(gate.is_recorded(2));
        assert_eq!(gate.state(2), UnlockState::Locked);

        gate.mark_completed(0);
        gate.mark_completed(1);
        assert_eq!(gate.frontier(), 3);
        assert_eq!(
            states(&gate, 4),
            vec![
                UnlockState::Completed,
                UnlockState::Completed,
                UnlockState::Completed,
                UnlockState::Unlocked
            ]
        );
    }

    #[test]
    fn accessible_sections_always_follow_a_completed_predecessor() {
        let n = 6;
        let mut gate = UnlockGate::new(n);
        for index in [4, 1, 0, 5, 3, 2] {
            let before = states(&gate, n);
            gate.mark_completed(index);
            let after = states(&gate, n);

            for i in 0..n {
                assert!(after[i] >= before[i], "section {i} moved backward");
                if i > 0 && after[i].is_accessible() {
                    assert_eq!(after[i - 1], UnlockState::Completed);
                }
            }
        }
        assert_eq!(gate.frontier(), n);
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut gate = UnlockGate::new(1);
        assert!(!gate.mark_completed(7));
        assert_eq!(gate.state(0), UnlockState::Unlocked);
    }
}
