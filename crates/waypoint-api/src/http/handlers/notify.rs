//! Event notification handler.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::Value;

use waypoint_types::workflow::NotifyResult;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// Body of a notify request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub event_id: String,
    #[serde(default)]
    pub event_data: Value,
}

/// POST /api/v1/notify - Resume every run waiting for an event.
///
/// Returns one entry per matched waiter. A waiter that could not be resumed
/// carries an `error`; the others carry the `messageId` of their resume.
pub async fn notify(
    State(state): State<AppState>,
    Json(body): Json<NotifyRequest>,
) -> Result<ApiResponse<Vec<NotifyResult>>, AppError> {
    let timer = RequestTimer::start();
    if body.event_id.trim().is_empty() {
        return Err(AppError::Validation("eventId must not be empty".to_string()));
    }

    let results = state.engine.notify(&body.event_id, body.event_data).await?;
    tracing::info!(event_id = %body.event_id, matched = results.len(), "event notified");
    Ok(timer.success(results))
}
