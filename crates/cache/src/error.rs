//! Cache errors.

use coursetrack_core::{CourseId, SectionId};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors from the content cache and prefetcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// A single item is larger than the whole budget
    #[error("content for {section} is {size} bytes, budget is {budget}")]
    TooLarge {
        /// Section
        section: SectionId,
        /// Content size
        size: u64,
        /// Cache budget
        budget: u64,
    },

    /// Everything left is pinned; nothing can be evicted
    #[error("cache budget exhausted by pinned entries ({needed} bytes needed)")]
    BudgetExhausted {
        /// Bytes that could not be freed
        needed: u64,
    },

    /// Section is not part of the course being planned
    #[error("section {section} is not part of course {course}")]
    UnknownSection {
        /// Section
        section: SectionId,
        /// Course
        course: CourseId,
    },

    /// Content could not be fetched
    #[error("fetch failed for {section}: {message}")]
    Fetch {
        /// Section
        section: SectionId,
        /// Failure description
        message: String,
    },
}
