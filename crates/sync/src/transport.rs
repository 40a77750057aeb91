//! Transports between the sync client and the progress server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coursetrack_core::{
    decode_batch, encode_batch, CourseId, CourseStructure, ProgressEvent, ProgressSnapshot,
    StudentId, SyncBatchResponse, UnlockMap,
};
use coursetrack_progress::{ProgressError, ProgressTracker};
use reqwest::{header, Client, ClientBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Connection to the authoritative ledger.
///
/// `send_batch` is the only call that writes; every call may fail
/// transiently and is retried by the reconciler.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send a batch of events in enqueue order.
    async fn send_batch(&self, events: &[ProgressEvent]) -> Result<SyncBatchResponse>;

    /// Canonical snapshot.
    async fn fetch_snapshot(&self, student: &StudentId, course: &CourseId)
        -> Result<ProgressSnapshot>;

    /// Canonical unlock state.
    async fn fetch_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap>;

    /// Current course hierarchy.
    async fn fetch_course_structure(&self, course: &CourseId) -> Result<CourseStructure>;
}

/// HTTP transport against `coursetrack serve`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `base_url` (e.g. `http://localhost:8080`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| SyncError::InvalidEndpoint(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidEndpoint(base_url.to_string()));
        }
        let client = ClientBuilder::new().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_err(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Transient(err.to_string())
        }
    }

    async fn read<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(SyncError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response.json().await.map_err(|e| self.map_err(e))
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.endpoint(segments)?;
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.read(response).await
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send_batch(&self, events: &[ProgressEvent]) -> Result<SyncBatchResponse> {
        let url = self.endpoint(&["v1", "sync", "batch"])?;
        let body = encode_batch(events).map_err(|e| SyncError::Corruption(e.to_string()))?;
        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.read(response).await
    }

    async fn fetch_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<ProgressSnapshot> {
        self.get(&[
            "v1",
            "students",
            student.as_str(),
            "courses",
            course.as_str(),
            "snapshot",
        ])
        .await
    }

    async fn fetch_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap> {
        self.get(&[
            "v1",
            "students",
            student.as_str(),
            "courses",
            course.as_str(),
            "unlock",
        ])
        .await
    }

    async fn fetch_course_structure(&self, course: &CourseId) -> Result<CourseStructure> {
        self.get(&["v1", "courses", course.as_str(), "structure"]).await
    }
}

/// In-process transport calling a [`ProgressTracker`] directly.
///
/// Events still pass through the wire representation, so server-assigned
/// fields are stripped exactly as over HTTP. Connectivity can be toggled to
/// exercise offline behaviour.
pub struct LocalTransport {
    tracker: Arc<dyn ProgressTracker>,
    online: AtomicBool,
    batches_sent: AtomicUsize,
    courses_fetched: AtomicUsize,
}

impl LocalTransport {
    /// Create an online transport.
    pub fn new(tracker: Arc<dyn ProgressTracker>) -> Self {
        Self {
            tracker,
            online: AtomicBool::new(true),
            batches_sent: AtomicUsize::new(0),
            courses_fetched: AtomicUsize::new(0),
        }
    }

    /// Simulate connectivity changes.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether calls currently reach the tracker.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Batches delivered so far.
    pub fn batches_sent(&self) -> usize {
        self.batches_sent.load(Ordering::SeqCst)
    }

    /// Course structures fetched so far.
    pub fn courses_fetched(&self) -> usize {
        self.courses_fetched.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Transient("offline".to_string()))
        }
    }
}

fn progress_error(err: ProgressError) -> SyncError {
    let status = match &err {
        ProgressError::UnknownCourse(_) => 404,
        ProgressError::Validation(_) => 400,
        ProgressError::Content(_) => 422,
        ProgressError::Storage(_) => 500,
    };
    SyncError::Http {
        status,
        message: err.to_string(),
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn send_batch(&self, events: &[ProgressEvent]) -> Result<SyncBatchResponse> {
        self.check_online()?;
        let body = encode_batch(events).map_err(|e| SyncError::Corruption(e.to_string()))?;
        let events = decode_batch(&body).map_err(|e| SyncError::Corruption(e.to_string()))?;
        let response = self.tracker.ingest_batch(events).await;
        self.batches_sent.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    }

    async fn fetch_snapshot(
        &self,
        student: &StudentId,
        course: &CourseId,
    ) -> Result<ProgressSnapshot> {
        self.check_online()?;
        self.tracker
            .get_snapshot(student, course)
            .await
            .map_err(progress_error)
    }

    async fn fetch_unlock_state(&self, student: &StudentId, course: &CourseId) -> Result<UnlockMap> {
        self.check_online()?;
        self.tracker
            .get_unlock_state(student, course)
            .await
            .map_err(progress_error)
    }

    async fn fetch_course_structure(&self, course: &CourseId) -> Result<CourseStructure> {
        self.check_online()?;
        self.courses_fetched.fetch_add(1, Ordering::SeqCst);
        self.tracker
            .get_course_structure(course)
            .await
            .map_err(progress_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_escape_identifiers() {
        let transport = HttpTransport::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        let url = transport
            .endpoint(&["v1", "students", "ada lovelace", "courses", "c/1", "snapshot"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/v1/students/ada%20lovelace/courses/c%2F1/snapshot"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpTransport::new("not a url", Duration::from_secs(1)),
            Err(SyncError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpTransport::new("mailto:someone@example.com", Duration::from_secs(1)),
            Err(SyncError::InvalidEndpoint(_))
        ));
    }
}
