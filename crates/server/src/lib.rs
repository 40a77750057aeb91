//! HTTP surface of the progress service.
//!
//! Thin axum handlers over [`ProgressService`]: sync batches, single
//! events, snapshots, unlock state, current position and course structure.

#![warn(missing_docs)]

pub mod error;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use coursetrack_progress::ProgressService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/v1/sync/batch", post(routes::sync_batch))
        .route("/v1/events", post(routes::submit_event))
        .route("/v1/courses/{course}/structure", get(routes::course_structure))
        .route(
            "/v1/students/{student}/courses/{course}/snapshot",
            get(routes::snapshot),
        )
        .route(
            "/v1/students/{student}/courses/{course}/unlock",
            get(routes::unlock_state),
        )
        .route(
            "/v1/students/{student}/courses/{course}/next",
            get(routes::next_section),
        )
        .route(
            "/v1/students/{student}/courses/{course}/position",
            get(routes::current_position).put(routes::report_position),
        )
        .with_state(state)
}

/// Serve `progress` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    progress: Arc<ProgressService>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "Progress server listening");
    let app = create_router(AppState::new(progress));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Progress server stopped");
    Ok(())
}
