//! Sync wire format shared by client and server.
//!
//! Batches travel as a JSON array of [`WireEvent`]; the server answers with
//! a [`SyncBatchResponse`] listing accepted and rejected event ids.

use serde::{Deserialize, Serialize};

use crate::event::{ProgressEvent, ProgressKind};
use crate::id::{DeviceId, EventId, SectionId, StudentId};
use crate::Time;

/// Errors while encoding or decoding wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Payload is not valid JSON for the expected shape
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One progress event as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Idempotency key (UUID string)
    pub event_id: EventId,

    /// Learner
    pub student_id: StudentId,

    /// Section
    pub section_id: SectionId,

    /// `true` for completion events
    pub completed: bool,

    /// Non-negative whole seconds
    pub time_spent_delta_seconds: u64,

    /// ISO-8601 client timestamp
    pub client_timestamp: Time,

    /// Originating device
    pub device_id: DeviceId,
}

impl From<&ProgressEvent> for WireEvent {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            event_id: event.event_id,
            student_id: event.student_id.clone(),
            section_id: event.section_id.clone(),
            completed: event.is_completion(),
            time_spent_delta_seconds: event.time_spent_delta_seconds,
            client_timestamp: event.client_timestamp,
            device_id: event.device_id.clone(),
        }
    }
}

impl From<WireEvent> for ProgressEvent {
    fn from(wire: WireEvent) -> Self {
        Self {
            event_id: wire.event_id,
            student_id: wire.student_id,
            section_id: wire.section_id,
            kind: if wire.completed {
                ProgressKind::SectionCompleted
            } else {
                ProgressKind::TimeSpentUpdate
            },
            time_spent_delta_seconds: wire.time_spent_delta_seconds,
            client_timestamp: wire.client_timestamp,
            device_id: wire.device_id,
            server_timestamp: None,
        }
    }
}

/// Encode events as a sync batch body.
pub fn encode_batch<'a>(events: impl IntoIterator<Item = &'a ProgressEvent>) -> Result<String, WireError> {
    let wire: Vec<WireEvent> = events.into_iter().map(WireEvent::from).collect();
    Ok(serde_json::to_string(&wire)?)
}

/// Decode a sync batch body.
pub fn decode_batch(body: &str) -> Result<Vec<ProgressEvent>, WireError> {
    let wire: Vec<WireEvent> = serde_json::from_str(body)?;
    Ok(wire.into_iter().map(ProgressEvent::from).collect())
}

/// Why the server refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Section id is not part of any known course
    UnknownSection,
    /// Event is structurally invalid for another reason
    InvalidEvent,
}

/// A rejected entry in a [`SyncBatchResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEvent {
    /// Event that was refused
    pub event_id: EventId,

    /// Machine-readable reason
    pub reason: RejectReason,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Server answer to a sync batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatchResponse {
    /// Applied or already-present events (both count as acknowledged)
    pub accepted: Vec<EventId>,

    /// Structurally invalid events
    pub rejected: Vec<RejectedEvent>,
}

impl SyncBatchResponse {
    /// Whether the server acknowledged an event.
    pub fn is_accepted(&self, id: &EventId) -> bool {
        self.accepted.contains(id)
    }
}

/// Result of appending one event to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    /// New event recorded
    Applied,
    /// Event id already present; nothing changed
    Duplicate,
}

/// Acknowledgement for a single submitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    /// Event that was acknowledged
    pub event_id: EventId,

    /// Whether it was new
    pub status: AppendOutcome,
}

/// Body of a position report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    /// Section the learner is looking at
    pub section_id: SectionId,

    /// Reporting device
    pub device_id: DeviceId,
}
