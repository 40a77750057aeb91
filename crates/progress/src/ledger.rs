//! Progress Ledger - append-only, idempotent event log.

use std::sync::Arc;

use coursetrack_core::{AppendOutcome, ProgressEvent};
use coursetrack_storage::{InsertOutcome, LedgerStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, ValidationError};
use crate::hierarchy::{HierarchyIndex, SectionLocation};

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Largest time delta a single event may carry
    pub max_time_delta_seconds: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_time_delta_seconds: 24 * 60 * 60,
        }
    }
}

impl LedgerConfig {
    /// Set the largest accepted time delta.
    pub fn with_max_time_delta_seconds(mut self, seconds: u64) -> Self {
        self.max_time_delta_seconds = seconds;
        self
    }
}

/// An append result together with the stored form of the event.
#[derive(Debug, Clone)]
pub struct Appended {
    /// Applied or duplicate
    pub outcome: AppendOutcome,

    /// The event as held by the ledger, with its server timestamp. For a
    /// duplicate this is the originally stored event.
    pub event: ProgressEvent,
}

/// Ledger over a [`LedgerStore`].
///
/// Idempotence comes from the store's atomic insert: an event id is stored
/// exactly once, and every later append of it is a no-op.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl Ledger {
    /// Create a ledger.
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Check an event against the hierarchy and the ledger's limits.
    pub fn validate<'a>(
        &self,
        event: &ProgressEvent,
        index: &'a HierarchyIndex,
    ) -> std::result::Result<&'a SectionLocation, ValidationError> {
        let location = index
            .locate(&event.section_id)
            .ok_or_else(|| ValidationError::UnknownSection(event.section_id.clone()))?;

        if event.time_spent_delta_seconds > self.config.max_time_delta_seconds {
            return Err(ValidationError::ExcessiveTimeDelta {
                event_id: event.event_id,
                seconds: event.time_spent_delta_seconds,
                max: self.config.max_time_delta_seconds,
            });
        }

        Ok(location)
    }

    /// Append a validated event, stamping its server timestamp.
    pub async fn append(&self, mut event: ProgressEvent) -> Result<Appended> {
        event.server_timestamp = Some(chrono::Utc::now());

        match self.store.insert_event(&event).await? {
            InsertOutcome::Inserted => {
                info!(
                    event_id = %event.event_id,
                    student_id = %event.student_id,
                    section_id = %event.section_id,
                    completed = event.is_completion(),
                    "Event applied"
                );
                Ok(Appended {
                    outcome: AppendOutcome::Applied,
                    event,
                })
            }
            InsertOutcome::AlreadyPresent => {
                debug!(event_id = %event.event_id, "Duplicate event ignored");
                let stored = self.store.load_event(event.event_id).await?.unwrap_or(event);
                Ok(Appended {
                    outcome: AppendOutcome::Duplicate,
                    event: stored,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursetrack_core::{Course, CourseId, CourseStructure, LessonOutline, SectionOutline};
    use coursetrack_storage::MemoryStorage;

    fn index() -> HierarchyIndex {
        let structure = CourseStructure {
            version: 1,
            lessons: vec![LessonOutline {
                id: "l1".into(),
                order: 0,
                sections: vec![SectionOutline {
                    id: "s1".into(),
                    order: 0,
                }],
            }],
        };
        let mut index = HierarchyIndex::new();
        index
            .insert(Course::from_structure("c".into(), structure).unwrap())
            .unwrap();
        index
    }

    fn ledger() -> (Ledger, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new());
        (Ledger::new(store.clone(), LedgerConfig::default()), store)
    }

    #[tokio::test]
    async fn second_append_is_duplicate_and_keeps_original_stamp() {
        let (ledger, store) = ledger();
        let event = ProgressEvent::completed("st".into(), "s1".into(), 30, "d".into());

        let first = ledger.append(event.clone()).await.unwrap();
        let second = ledger.append(event).await.unwrap();

        assert_eq!(first.outcome, AppendOutcome::Applied);
        assert_eq!(second.outcome, AppendOutcome::Duplicate);
        assert_eq!(second.event.server_timestamp, first.event.server_timestamp);
        assert_eq!(store.event_count().await, 1);
    }

    #[test]
    fn validation_rejects_unknown_sections_and_huge_deltas() {
        let (ledger, _) = ledger();
        let index = index();

        let ghost = ProgressEvent::completed("st".into(), "ghost".into(), 0, "d".into());
        assert!(matches!(
            ledger.validate(&ghost, &index),
            Err(ValidationError::UnknownSection(_))
        ));

        let huge = ProgressEvent::time_spent("st".into(), "s1".into(), 90_000, "d".into());
        assert!(matches!(
            ledger.validate(&huge, &index),
            Err(ValidationError::ExcessiveTimeDelta { .. })
        ));

        let ok = ProgressEvent::time_spent("st".into(), "s1".into(), 600, "d".into());
        assert_eq!(ledger.validate(&ok, &index).unwrap().course_id, CourseId::new("c"));
    }
}
