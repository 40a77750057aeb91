//! API errors and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coursetrack_core::RejectReason;
use coursetrack_progress::ProgressError;
use serde::Serialize;
use tracing::error;

/// Result type for handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Handler failures.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Event or request failed validation (400)
    #[error("{message}")]
    Invalid {
        /// Wire reason
        reason: RejectReason,
        /// Detail
        message: String,
    },

    /// Course or resource does not exist (404)
    #[error("{0}")]
    NotFound(String),

    /// Content collaborator returned something unusable (422)
    #[error("{0}")]
    Content(String),

    /// Storage or other server-side failure (500)
    #[error("{0}")]
    Internal(String),

    /// Backing store unreachable (503)
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
    message: String,
}

impl From<ProgressError> for ApiError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Validation(v) => ApiError::Invalid {
                reason: v.reject_reason(),
                message: v.to_string(),
            },
            ProgressError::UnknownCourse(id) => ApiError::NotFound(format!("unknown course: {id}")),
            ProgressError::Content(message) => ApiError::Content(message),
            ProgressError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, reason) = match &self {
            ApiError::Invalid { reason, .. } => (StatusCode::BAD_REQUEST, "invalid", Some(*reason)),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            ApiError::Content(_) => (StatusCode::UNPROCESSABLE_ENTITY, "content", None),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None),
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: kind,
            reason,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
