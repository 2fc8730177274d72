//! Application error type mapping to HTTP status codes and envelope format.
//!
//! Scheduler deliveries treat any non-2xx answer as "retry later", so only
//! errors that a redelivery cannot fix are mapped to 4xx.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use waypoint_core::workflow::EngineError;
use waypoint_infra::signature::SignatureError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    /// Missing or invalid request signature.
    Unauthorized(String),
    Validation(String),
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<SignatureError> for AppError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::InvalidKey(msg) => AppError::Internal(format!("signing key: {msg}")),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Engine(EngineError::WorkflowNotFound(name)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow '{name}' is not registered"),
                None,
            ),
            AppError::Engine(EngineError::MalformedEnvelope(e)) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_ENVELOPE", e.to_string(), None)
            }
            AppError::Engine(EngineError::RunNotFound(run_id)) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("Run '{run_id}' not found"),
                None,
            ),
            AppError::Engine(EngineError::Busy { run_id, step }) => (
                StatusCode::CONFLICT,
                "RUN_BUSY",
                format!("Run '{run_id}' is executing step '{step}'"),
                Some(json!({ "runId": run_id, "step": step })),
            ),
            AppError::Engine(EngineError::FailureHandlerBusy(run_id)) => (
                StatusCode::CONFLICT,
                "FAILURE_HANDLER_BUSY",
                format!("Failure handler of run '{run_id}' is already running"),
                Some(json!({ "runId": run_id })),
            ),
            AppError::Engine(EngineError::FailureCallback(msg)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "FAILURE_CALLBACK_PENDING",
                msg.clone(),
                None,
            ),
            AppError::Engine(e @ EngineError::Scheduler(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SCHEDULER_ERROR", e.to_string(), None)
            }
            AppError::Engine(e @ EngineError::Repository(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string(), None)
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone(), None)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        } else {
            tracing::debug!(code, %message, status = status.as_u16(), "request rejected");
        }
        ApiResponse::error(status, code, &message, details).into_response()
    }
}
