//! Progress engine (server side)
//!
//! Content hierarchy index, idempotent progress ledger, incremental
//! aggregation, the sequential unlock gate and the service tying them
//! together per student and course.

#![warn(missing_docs)]

pub mod error;
pub mod hierarchy;
pub mod ledger;
pub mod aggregation;
pub mod unlock;
pub mod context;
pub mod tracker;
pub mod service;

pub use error::{ProgressError, Result, ValidationError};
pub use hierarchy::{
    ContentSource, HierarchyIndex, SectionLocation, StaticContentSource, StoreContentSource,
};
pub use ledger::{Appended, Ledger, LedgerConfig};
pub use aggregation::{percent, Aggregates};
pub use unlock::UnlockGate;
pub use context::{ApplyEffect, CourseProgress};
pub use tracker::ProgressTracker;
pub use service::{ProgressConfig, ProgressService};
