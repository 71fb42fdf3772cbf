//! Dispatch HTTP API.
//!
//! Thin axum layer over the [`Dispatcher`]; every handler is a direct call
//! into the service so the HTTP path and the in-process path cannot drift.
//!
//! Routes:
//! - `GET  /jobs/pull?role=<r>&mode=<m>` — lease a job (204 when empty)
//! - `POST /jobs/push` — complete a job, returns `{next_jobs}`
//! - `POST /jobs/create` — admit a job, returns `{job_id, pipeline_id}`
//! - `GET  /jobs/status` — counts by state plus runtime counters
//! - `GET  /jobs/list?pipeline_id=<p>` — ordered jobs of a pipeline
//! - `POST /pipelines/{id}/cancel` — flip the cancellation flag

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use fm_core::types::{Mode, Role};
use fm_telemetry::tracing_setup::dispatch_trace_middleware;

use crate::api_error::ApiError;
use crate::dispatcher::{CreateBody, CreateResponse, Dispatcher, DispatchError, PushBody};

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

/// Shared application state for the dispatch handlers.
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the dispatch router with CORS and the dispatch trace middleware
/// applied.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/jobs/pull", get(pull_job))
        .route("/jobs/push", post(push_job))
        .route("/jobs/create", post(create_job))
        .route("/jobs/status", get(job_status))
        .route("/jobs/list", get(list_jobs))
        .route("/pipelines/{id}/cancel", post(cancel_pipeline))
        .layer(axum::middleware::from_fn(dispatch_trace_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PullParams {
    role: String,
    mode: String,
}

/// GET /jobs/pull — lease the best pending job for a worker.
async fn pull_job(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<PullParams>,
) -> Result<impl IntoResponse, ApiError> {
    let role: Role = params
        .role
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let mode: Mode = params
        .mode
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    match state.dispatcher.pull(role, mode) {
        Some(job) => Ok((StatusCode::OK, Json(json!(job))).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /jobs/push — complete a leased job; replies with the successors.
async fn push_job(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PushBody>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.dispatcher.push(body).map_err(map_dispatch_error)?;
    Ok(Json(response))
}

/// POST /jobs/create — admit a job (and possibly open a pipeline).
async fn create_job(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (job, _created) = state.dispatcher.create_job(body).map_err(map_dispatch_error)?;
    Ok(Json(CreateResponse {
        job_id: job.id,
        pipeline_id: job.pipeline_id,
    }))
}

/// GET /jobs/status — summary counts plus runtime counters.
async fn job_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let status = state.dispatcher.status();
    let counters = state.dispatcher.counters_snapshot();
    Json(json!({
        "jobs": status,
        "counters": counters.counters,
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    pipeline_id: Uuid,
}

/// GET /jobs/list — ordered jobs of one pipeline.
async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let jobs = state.dispatcher.list_pipeline(params.pipeline_id);
    Json(json!({"jobs": jobs}))
}

/// POST /pipelines/{id}/cancel — flip the per-pipeline cancellation flag.
async fn cancel_pipeline(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let dropped = state.dispatcher.cancel_pipeline(id);
    Json(json!({"pipeline_id": id, "pending_jobs_cancelled": dropped}))
}

fn map_dispatch_error(err: DispatchError) -> ApiError {
    match err {
        DispatchError::Queue(queue_err) => queue_err.into(),
        DispatchError::EmptyPush => {
            ApiError::Unprocessable("push must carry a result or an error".into())
        }
        DispatchError::Log(e) => ApiError::Internal(e.to_string()),
    }
}
