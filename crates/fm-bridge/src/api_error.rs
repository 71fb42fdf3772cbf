use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::queue::QueueError;

/// Unified error type for the dispatch HTTP handlers.
///
/// Each variant maps to a status code and a JSON body of the form
/// `{"error": "<message>"}`. `DuplicatePush` additionally replays the
/// original `next_jobs` so a retried push remains a no-op to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// 409: this job was already pushed; the recorded successors ride along.
    #[error("duplicate push for job {job_id}")]
    DuplicatePush {
        job_id: Uuid,
        next_jobs: Vec<Uuid>,
    },

    /// 410: the lease expired before the push arrived.
    #[error("lease expired: {0}")]
    LeaseExpired(Uuid),

    /// 422: the request was well-formed JSON that violates the contract.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({"error": msg}))).into_response()
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            ApiError::DuplicatePush { job_id, next_jobs } => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": format!("job {job_id} already pushed"),
                    "next_jobs": next_jobs,
                })),
            )
                .into_response(),
            ApiError::LeaseExpired(job_id) => (
                StatusCode::GONE,
                Json(json!({"error": format!("lease expired for job {job_id}")})),
            )
                .into_response(),
            ApiError::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": msg})),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": msg})),
            )
                .into_response(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            QueueError::DuplicatePush { job_id, next_jobs } => {
                ApiError::DuplicatePush { job_id, next_jobs }
            }
            QueueError::LeaseExpired(id) => ApiError::LeaseExpired(id),
            QueueError::InvalidState { .. } => ApiError::Unprocessable(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
