//! Section content cache and prefetching.
//!
//! A byte-bounded LRU cache of section content, a planner that picks the
//! next accessible sections to warm, and a best-effort prefetcher that
//! fills the cache without ever blocking navigation.

#![warn(missing_docs)]

pub mod error;
pub mod cache;
pub mod planner;
pub mod prefetcher;

pub use error::{CacheError, Result};
pub use cache::{CacheConfig, CacheStats, ContentCache, SectionContent};
pub use planner::{PlannerConfig, PrefetchPlan, PrefetchPlanner};
pub use prefetcher::{ContentFetcher, PrefetchReport, Prefetcher};
