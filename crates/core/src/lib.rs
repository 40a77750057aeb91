//! Coursetrack core data models.
//!
//! This crate defines the data structures shared by the progress engine,
//! the sync client and the HTTP surface: identifiers, the content
//! hierarchy, progress events, derived snapshots and the sync wire format.

#![warn(missing_docs)]

// Identities
mod id;

// Content
mod hierarchy;

// Progress facts and derived views
mod event;
mod snapshot;
mod position;
mod queue_entry;

// Protocol
pub mod wire;

// Re-exports
pub use id::*;

pub use hierarchy::{
    Course, CourseStructure, HierarchyError, Lesson, LessonOutline, Section, SectionOutline,
};
pub use event::{ProgressEvent, ProgressKind};
pub use snapshot::{ProgressSnapshot, UnlockMap, UnlockState};
pub use position::CurrentPosition;
pub use queue_entry::SyncQueueEntry;
pub use wire::{
    AppendOutcome, EventAck, PositionReport, RejectReason, RejectedEvent, SyncBatchResponse,
    WireError, WireEvent, decode_batch, encode_batch,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
