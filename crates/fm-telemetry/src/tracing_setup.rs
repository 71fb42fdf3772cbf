use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Generate a request id (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 32 hex chars.
    Uuid::new_v4().as_simple().to_string()
}

/// Create a span scoped to one pipeline, for correlating every job and
/// backend call that serves the same user request.
pub fn pipeline_span(pipeline_id: Uuid) -> tracing::Span {
    tracing::info_span!("pipeline", pipeline_id = %pipeline_id)
}

/// Create a span for a single job execution under a pipeline.
pub fn job_span(pipeline_id: Uuid, job_id: Uuid, role: &str) -> tracing::Span {
    tracing::info_span!(
        "job",
        pipeline_id = %pipeline_id,
        job_id = %job_id,
        role = %role,
    )
}

// ---------------------------------------------------------------------------
// Dispatch middleware
// ---------------------------------------------------------------------------

/// Axum middleware that wraps every dispatch request in a correlated span.
///
/// When the request names a pipeline (a `pipeline_id` query parameter or a
/// `/pipelines/{id}/...` path), the span carries that id, so HTTP-side log
/// lines line up with the [`pipeline_span`]/[`job_span`] records emitted by
/// the queue and the supervisor for the same request. An `x-request-id`
/// header is honored when present, minted otherwise, and always echoed on
/// the response.
pub async fn dispatch_trace_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);

    if let Ok(value) = request_id.parse() {
        request.headers_mut().insert("x-request-id", value);
    }

    let span = dispatch_span(&request, &request_id);
    let echo = request_id.clone();

    async move {
        tracing::debug!("dispatch request");
        let mut response = next.run(request).await;
        tracing::debug!(status = %response.status(), "dispatch response");
        if let Ok(value) = echo.parse() {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

/// Build the per-request span, anchored to the pipeline when the request
/// names one.
fn dispatch_span(request: &Request<Body>, request_id: &str) -> tracing::Span {
    let method = request.method();
    let path = request.uri().path();
    match pipeline_id_of(request) {
        Some(pipeline_id) => tracing::info_span!(
            "dispatch",
            request_id = %request_id,
            method = %method,
            path = %path,
            pipeline_id = %pipeline_id,
        ),
        None => tracing::info_span!(
            "dispatch",
            request_id = %request_id,
            method = %method,
            path = %path,
        ),
    }
}

/// Pull the pipeline id out of a dispatch request, when it carries one:
/// either `?pipeline_id=<uuid>` (list/status queries) or a
/// `/pipelines/{uuid}/...` path (cancel).
fn pipeline_id_of(request: &Request<Body>) -> Option<Uuid> {
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("pipeline_id=") {
                if let Ok(id) = value.parse() {
                    return Some(id);
                }
            }
        }
    }

    let path = request.uri().path();
    if let Some(rest) = path.strip_prefix("/pipelines/") {
        if let Some(segment) = rest.split('/').next() {
            if let Ok(id) = segment.parse() {
                return Some(id);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
