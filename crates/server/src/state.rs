//! Shared handler state.

use std::sync::Arc;

use coursetrack_progress::ProgressService;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The progress engine
    pub progress: Arc<ProgressService>,

    /// When the server started
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Wrap a service.
    pub fn new(progress: Arc<ProgressService>) -> Self {
        Self {
            progress,
            started_at: chrono::Utc::now(),
        }
    }
}
