//! Lifecycle events broadcast by the workflow engine.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::workflow::{RunId, StepKey, StepKind};

/// Events emitted while runs make progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: RunId,
        workflow: String,
    },
    /// A new step was recorded and handed to the scheduler.
    StepScheduled {
        run_id: RunId,
        step: StepKey,
        kind: StepKind,
    },
    StepSucceeded {
        run_id: RunId,
        step: StepKey,
        kind: StepKind,
    },
    /// A RUN step failed and another attempt was scheduled.
    StepRetrying {
        run_id: RunId,
        step: StepKey,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepFailed {
        run_id: RunId,
        step: StepKey,
        error: String,
    },
    /// The invocation stopped at an unresolved step.
    RunSuspended {
        run_id: RunId,
    },
    RunSucceeded {
        run_id: RunId,
    },
    RunFailed {
        run_id: RunId,
        error: String,
    },
    RunCanceled {
        run_id: RunId,
    },
    WaiterNotified {
        run_id: RunId,
        event_id: String,
    },
    WaiterTimedOut {
        run_id: RunId,
        event_id: String,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepScheduled { run_id, .. }
            | WorkflowEvent::StepSucceeded { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::RunSuspended { run_id }
            | WorkflowEvent::RunSucceeded { run_id }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunCanceled { run_id }
            | WorkflowEvent::WaiterNotified { run_id, .. }
            | WorkflowEvent::WaiterTimedOut { run_id, .. } => run_id,
        }
    }
}
