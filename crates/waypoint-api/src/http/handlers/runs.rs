//! Run inspection, cancellation and triggering handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use waypoint_core::workflow::RunLedger;
use waypoint_types::workflow::{RunId, WorkflowRun, WorkflowRunStatus};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Query parameters for listing runs.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Filter by status (e.g. `waiting`, `FAILED`).
    pub status: Option<String>,
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

/// Query parameters for triggering a run.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    /// Caller-chosen run id; triggering twice with it starts one run.
    pub run_id: Option<String>,
}

fn parse_run_id(raw: &str) -> Result<RunId, AppError> {
    raw.parse::<RunId>().map_err(AppError::Validation)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/runs - List recent runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<ApiResponse<Vec<WorkflowRun>>, AppError> {
    let timer = RequestTimer::start();
    let status = query
        .status
        .as_deref()
        .map(str::parse::<WorkflowRunStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    let runs = state.engine.list_runs(status, query.limit.min(500)).await?;
    Ok(timer.success(runs).with_link("self", "/api/v1/runs"))
}

/// GET /api/v1/runs/{run_id} - A run with its step ledger and waiters.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<ApiResponse<RunLedger>, AppError> {
    let timer = RequestTimer::start();
    let run_id = parse_run_id(&run_id)?;
    let ledger = state.engine.ledger(&run_id).await?;

    Ok(timer
        .success(ledger)
        .with_link("self", &format!("/api/v1/runs/{run_id}"))
        .with_link("cancel", &format!("/api/v1/runs/{run_id}/cancel")))
}

/// POST /api/v1/runs/{run_id}/cancel - Cancel a live run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<ApiResponse<Value>, AppError> {
    let timer = RequestTimer::start();
    let run_id = parse_run_id(&run_id)?;
    let canceled = state.engine.cancel(&run_id).await?;

    Ok(timer
        .success(json!({ "runId": run_id, "canceled": canceled }))
        .with_link("run", &format!("/api/v1/runs/{run_id}")))
}

/// GET /api/v1/workflows - Names of the registered workflows.
pub async fn list_workflows(State(state): State<AppState>) -> ApiResponse<Vec<Value>> {
    let timer = RequestTimer::start();
    let workflows = state
        .engine
        .registry()
        .names()
        .into_iter()
        .map(|name| json!({ "name": name, "url": state.workflow_url(&name) }))
        .collect();
    timer.success(workflows)
}

/// POST /api/v1/workflows/{name}/trigger - Start a run through the scheduler.
///
/// The raw request body becomes the trigger payload.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TriggerQuery>,
    body: Bytes,
) -> Result<ApiResponse<Value>, AppError> {
    let timer = RequestTimer::start();
    if state.engine.registry().get(&name).is_none() {
        return Err(AppError::NotFound(format!("Workflow '{name}' is not registered")));
    }
    let run_id = query.run_id.as_deref().map(parse_run_id).transpose()?;

    let url = state.workflow_url(&name);
    let triggered = state
        .client
        .trigger(&url, body.to_vec(), run_id)
        .await
        .map_err(|e| AppError::Engine(e.into()))?;

    Ok(timer
        .success(json!({
            "runId": triggered.run_id,
            "messageId": triggered.message_id,
            "workflowUrl": url,
        }))
        .with_link("run", &format!("/api/v1/runs/{}", triggered.run_id))
        .with_status(axum::http::StatusCode::ACCEPTED))
}
