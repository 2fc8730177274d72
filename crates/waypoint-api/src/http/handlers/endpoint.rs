//! Workflow endpoint: the URL the durable scheduler delivers to.
//!
//! Every invocation of every run lands here. The handler verifies the request
//! signature, converts the HTTP request into an [`InboundRequest`] and lets the
//! engine replay the workflow. Any error is answered non-2xx so the scheduler
//! redelivers; ignored duplicates and stale deliveries answer 200.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::HeaderMap;

use waypoint_core::workflow::InvocationOutcome;
use waypoint_types::envelope::{HEADER_SIGNATURE, InboundRequest};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /workflows/{name} - Serve one invocation of workflow `name`.
pub async fn invoke_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse<InvocationOutcome>, AppError> {
    let timer = RequestTimer::start();

    let signature = headers.get(HEADER_SIGNATURE).and_then(|v| v.to_str().ok());
    state.signer.verify(&body, signature)?;

    let request = inbound_request(&state, &headers, uri.path(), body.to_vec());
    let outcome = state.engine.handle(&name, request).await?;

    match &outcome {
        InvocationOutcome::Ignored { run_id, reason } => {
            tracing::debug!(workflow = %name, run_id = ?run_id, reason, "invocation ignored");
        }
        other => {
            tracing::debug!(workflow = %name, run_id = ?other.run_id(), "invocation served");
        }
    }

    let mut resp = timer.success(outcome.clone());
    if let Some(run_id) = outcome.run_id() {
        resp = resp.with_link("run", &format!("/api/v1/runs/{run_id}"));
    }
    Ok(resp)
}

/// Convert an HTTP request into the engine's transport-neutral view.
///
/// The request URL is rebuilt from the `Host` header; the engine only uses it
/// when neither the endpoint nor the config sets a base URL.
fn inbound_request(state: &AppState, headers: &HeaderMap, path: &str, body: Vec<u8>) -> InboundRequest {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| state.config().listen.clone());

    let mut request = InboundRequest::new(format!("http://{host}{path}"), body);
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    request
}
