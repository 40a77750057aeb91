//! HTTP handlers

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use coursetrack_core::{
    decode_batch, CourseId, CourseStructure, CurrentPosition, EventAck, PositionReport,
    ProgressEvent, ProgressSnapshot, RejectReason, SectionId, StudentId, SyncBatchResponse,
    UnlockMap, WireEvent,
};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    if !state.progress.health_check().await {
        return Err(ApiError::Unavailable("ledger store unreachable".to_string()));
    }
    let uptime = chrono::Utc::now() - state.started_at;
    Ok(Json(json!({
        "status": "ok",
        "uptimeSecs": uptime.num_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// POST /v1/sync/batch
///
/// 200 with per-event verdicts in the body; 400 only when the body is not a batch.
pub async fn sync_batch(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<SyncBatchResponse>> {
    let events = decode_batch(&body).map_err(|e| ApiError::Invalid {
        reason: RejectReason::InvalidEvent,
        message: e.to_string(),
    })?;
    debug!(events = events.len(), "Sync batch received");
    Ok(Json(state.progress.ingest_batch(events).await))
}

/// POST /v1/events
pub async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<WireEvent>,
) -> Result<Json<EventAck>> {
    let event = ProgressEvent::from(event);
    let event_id = event.event_id;
    let status = state.progress.append(event).await?;
    Ok(Json(EventAck { event_id, status }))
}

/// GET /v1/courses/{course}/structure
pub async fn course_structure(
    State(state): State<AppState>,
    Path(course): Path<CourseId>,
) -> Result<Json<CourseStructure>> {
    Ok(Json(state.progress.course_structure(&course).await?))
}

/// GET /v1/students/{student}/courses/{course}/snapshot
pub async fn snapshot(
    State(state): State<AppState>,
    Path((student, course)): Path<(StudentId, CourseId)>,
) -> Result<Json<ProgressSnapshot>> {
    Ok(Json(state.progress.get_snapshot(&student, &course).await?))
}

/// GET /v1/students/{student}/courses/{course}/unlock
pub async fn unlock_state(
    State(state): State<AppState>,
    Path((student, course)): Path<(StudentId, CourseId)>,
) -> Result<Json<UnlockMap>> {
    Ok(Json(state.progress.get_unlock_state(&student, &course).await?))
}

/// Resume point
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSection {
    /// First unlocked, not yet completed section; `None` when the course is done
    pub section_id: Option<SectionId>,
}

/// GET /v1/students/{student}/courses/{course}/next
pub async fn next_section(
    State(state): State<AppState>,
    Path((student, course)): Path<(StudentId, CourseId)>,
) -> Result<Json<NextSection>> {
    let section_id = state.progress.next_section(&student, &course).await?;
    Ok(Json(NextSection { section_id }))
}

/// GET /v1/students/{student}/courses/{course}/position
pub async fn current_position(
    State(state): State<AppState>,
    Path((student, course)): Path<(StudentId, CourseId)>,
) -> Result<Json<CurrentPosition>> {
    state
        .progress
        .current_position(&student, &course)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no position for {student} in {course}")))
}

/// PUT /v1/students/{student}/courses/{course}/position
///
/// Returns the winning position, which may be another device's.
pub async fn report_position(
    State(state): State<AppState>,
    Path((student, course)): Path<(StudentId, CourseId)>,
    Json(report): Json<PositionReport>,
) -> Result<Json<CurrentPosition>> {
    let winner = state
        .progress
        .report_position(&student, &course, &report.section_id, &report.device_id)
        .await?;
    Ok(Json(winner))
}
