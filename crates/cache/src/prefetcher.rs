//! Best-effort prefetcher.
//!
//! Fetches planned sections into the shared cache. Failures are remembered
//! and retried on the next plan or an explicit [`Prefetcher::retry_failed`];
//! they are never surfaced to navigation.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use coursetrack_core::{CourseId, SectionId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ContentCache, SectionContent};
use crate::error::Result;
use crate::planner::PrefetchPlan;

/// Source of section content.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the payload of one section.
    async fn fetch_section(&self, course: &CourseId, section: &SectionId) -> Result<Vec<u8>>;
}

/// Outcome of one prefetch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Newly cached sections
    pub fetched: Vec<SectionId>,

    /// Sections that were already cached
    pub already_cached: Vec<SectionId>,

    /// Sections that failed and will be retried
    pub failed: Vec<SectionId>,

    /// Sections evicted to make room
    pub evicted: Vec<SectionId>,
}

/// Fills a [`ContentCache`] ahead of navigation.
pub struct Prefetcher {
    cache: Arc<Mutex<ContentCache>>,
    fetcher: Arc<dyn ContentFetcher>,
    retry: Mutex<BTreeSet<(CourseId, SectionId)>>,
}

impl Prefetcher {
    /// Create a prefetcher over a shared cache.
    pub fn new(cache: Arc<Mutex<ContentCache>>, fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self {
            cache,
            fetcher,
            retry: Mutex::new(BTreeSet::new()),
        }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<Mutex<ContentCache>> {
        &self.cache
    }

    /// Activate the plan's course and pins, then fetch what is missing.
    ///
    /// Earlier failures for the same course are retried in the same pass.
    pub async fn apply(&self, plan: &PrefetchPlan) -> PrefetchReport {
        self.cache
            .lock()
            .await
            .set_active(plan.course_id.clone(), plan.pinned.iter().cloned());

        let mut wanted: Vec<SectionId> = plan.prefetch.clone();
        {
            let retry = self.retry.lock().await;
            for (course, section) in retry.iter() {
                if course == &plan.course_id && !wanted.contains(section) {
                    wanted.push(section.clone());
                }
            }
        }

        let report = self.fetch_all(&plan.course_id, &wanted).await;
        info!(
            course = %plan.course_id,
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            "Prefetch pass finished"
        );
        report
    }

    /// Run [`Prefetcher::apply`] in the background.
    pub fn spawn(self: &Arc<Self>, plan: PrefetchPlan) -> JoinHandle<PrefetchReport> {
        let this = self.clone();
        tokio::spawn(async move { this.apply(&plan).await })
    }

    /// Retry every remembered failure.
    pub async fn retry_failed(&self) -> PrefetchReport {
        let pending: Vec<(CourseId, SectionId)> =
            self.retry.lock().await.iter().cloned().collect();
        let mut report = PrefetchReport::default();
        for (course, section) in pending {
            let one = self.fetch_all(&course, std::slice::from_ref(&section)).await;
            report.fetched.extend(one.fetched);
            report.already_cached.extend(one.already_cached);
            report.failed.extend(one.failed);
            report.evicted.extend(one.evicted);
        }
        report
    }

    /// Sections waiting for a retry.
    pub async fn pending_retries(&self) -> usize {
        self.retry.lock().await.len()
    }

    /// Content for navigation: cached copy, or fetched on demand.
    ///
    /// A failed on-demand fetch is returned to the caller but not retried.
    pub async fn load(&self, course: &CourseId, section: &SectionId) -> Result<Arc<SectionContent>> {
        if let Some(content) = self.cache.lock().await.get(section) {
            return Ok(content);
        }
        let body = self.fetcher.fetch_section(course, section).await?;
        let content = SectionContent::new(course.clone(), section.clone(), body);
        let shared = Arc::new(content.clone());
        if let Err(e) = self.cache.lock().await.put(content) {
            debug!(section = %section, error = %e, "Loaded content not cached");
        }
        Ok(shared)
    }

    /// Cache statistics.
    pub async fn stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    async fn fetch_all(&self, course: &CourseId, sections: &[SectionId]) -> PrefetchReport {
        let mut report = PrefetchReport::default();
        for section in sections {
            if self.cache.lock().await.contains(section) {
                self.retry.lock().await.remove(&(course.clone(), section.clone()));
                report.already_cached.push(section.clone());
                continue;
            }

            let fetched = self.fetcher.fetch_section(course, section).await;
            let outcome = match fetched {
                Ok(body) => {
                    let content = SectionContent::new(course.clone(), section.clone(), body);
                    self.cache.lock().await.put(content)
                }
                Err(e) => Err(e),
            };

            let key = (course.clone(), section.clone());
            match outcome {
                Ok(evicted) => {
                    self.retry.lock().await.remove(&key);
                    report.evicted.extend(evicted);
                    report.fetched.push(section.clone());
                }
                Err(e) => {
                    warn!(course = %course, section = %section, error = %e, "Prefetch failed");
                    self.retry.lock().await.insert(key);
                    report.failed.push(section.clone());
                }
            }
        }
        report
    }
}
