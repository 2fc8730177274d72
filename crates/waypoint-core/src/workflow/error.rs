//! Error types of the workflow engine.
//!
//! `WorkflowError` is what workflow code observes from step primitives.
//! `Suspended`, `Busy` and `Canceled` are control flow: workflow code must
//! propagate them with `?`. `EngineError` is what the HTTP boundary sees.

use waypoint_types::error::{EnvelopeError, RepositoryError, SchedulerError};
use waypoint_types::workflow::{RunId, StepFailure, StepKey, StepKind};

/// Errors surfaced to workflow functions by `WorkflowContext`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The invocation reached unresolved work and must stop here.
    #[error("workflow suspended")]
    Suspended,

    /// Another invocation holds the execution lease of this step.
    #[error("step {step} is being executed by another invocation")]
    Busy { step: StepKey },

    /// A step failed terminally (retries exhausted or a failed CALL).
    #[error("step {step} failed: {failure}")]
    StepFailed { step: StepKey, failure: StepFailure },

    /// The run was canceled.
    #[error("workflow run canceled")]
    Canceled,

    /// The ledger recorded a different step kind at this position.
    #[error("ledger mismatch at {step}: recorded {recorded}, reached {reached}")]
    LedgerMismatch {
        step: StepKey,
        recorded: StepKind,
        reached: StepKind,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Error raised by workflow code itself.
    #[error("{0}")]
    User(String),
}

impl WorkflowError {
    /// Errors that stop the invocation without failing the run.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            WorkflowError::Suspended | WorkflowError::Busy { .. } | WorkflowError::Canceled
        )
    }

    /// Infrastructure errors: the invocation should be redelivered.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, WorkflowError::Repository(_) | WorkflowError::Scheduler(_))
    }

    /// The step failure to report to the failure handler.
    pub fn failure(&self) -> (Option<StepKey>, StepFailure) {
        match self {
            WorkflowError::StepFailed { step, failure } => (Some(step.clone()), failure.clone()),
            WorkflowError::LedgerMismatch { step, .. } => {
                (Some(step.clone()), StepFailure::message(self.to_string()))
            }
            other => (None, StepFailure::message(other.to_string())),
        }
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<WorkflowError>() {
            Ok(inner) => inner,
            Err(err) => WorkflowError::User(format!("{err:#}")),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

/// Errors returned by `WorkflowEngine` to the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not registered: {0}")]
    WorkflowNotFound(String),

    #[error(transparent)]
    MalformedEnvelope(#[from] EnvelopeError),

    #[error("workflow run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {run_id} is busy at step {step}")]
    Busy { run_id: RunId, step: StepKey },

    #[error("failure handler of run {0} is running in another invocation")]
    FailureHandlerBusy(RunId),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The failure function or failure URL could not be reached; the run
    /// stays FAILED_PENDING_CALLBACK until a redelivery succeeds.
    #[error("failure callback error: {0}")]
    FailureCallback(String),
}

impl EngineError {
    /// Build from a workflow error that escaped to the engine boundary.
    pub(crate) fn from_workflow(run_id: &RunId, err: WorkflowError) -> Self {
        match err {
            WorkflowError::Repository(e) => EngineError::Repository(e),
            WorkflowError::Scheduler(e) => EngineError::Scheduler(e),
            WorkflowError::Busy { step } => EngineError::Busy {
                run_id: run_id.clone(),
                step,
            },
            other => EngineError::Repository(RepositoryError::Query(other.to_string())),
        }
    }
}
