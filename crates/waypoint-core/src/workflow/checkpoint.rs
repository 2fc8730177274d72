//! Durable checkpoint manager for one run.
//!
//! Wraps `WorkflowRepository` with the step-level operations an invocation
//! performs while replaying a workflow. Every transition is persisted before
//! the workflow moves forward, logged (at `info` when the endpoint is
//! verbose, `debug` otherwise) and broadcast on the `EventBus`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    RunId, StepCompletion, StepFailure, StepKey, StepKind, StepRecord,
};

use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Step checkpoints of a single run.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: Arc<R>,
    bus: EventBus,
    run_id: RunId,
    verbose: bool,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, bus: EventBus, run_id: RunId, verbose: bool) -> Self {
        Self {
            repo,
            bus,
            run_id,
            verbose,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn log(&self, step: &StepKey, message: &str) {
        if self.verbose {
            tracing::info!(run_id = %self.run_id, step = %step, "{message}");
        } else {
            tracing::debug!(run_id = %self.run_id, step = %step, "{message}");
        }
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn load_step(&self, key: &StepKey) -> Result<Option<StepRecord>, WorkflowError> {
        Ok(self.repo.get_step(&self.run_id, key).await?)
    }

    /// Record a newly reached step. Returns `false` if another invocation
    /// recorded it first.
    pub async fn checkpoint_step_scheduled(&self, record: &StepRecord) -> Result<bool, WorkflowError> {
        let inserted = self.repo.insert_step(record).await?;
        if inserted {
            self.log(&record.key, "checkpointed step scheduled");
            self.bus.publish(WorkflowEvent::StepScheduled {
                run_id: self.run_id.clone(),
                step: record.key.clone(),
                kind: record.kind(),
            });
        }
        Ok(inserted)
    }

    /// Take the execution lease for one attempt of a step body.
    pub async fn checkpoint_attempt_start(
        &self,
        key: &StepKey,
        token: &str,
        lease: Duration,
    ) -> Result<Option<u32>, WorkflowError> {
        let lease_until = lease_deadline(Utc::now(), lease);
        let attempt = self
            .repo
            .begin_attempt(&self.run_id, key, token, lease_until)
            .await?;
        match attempt {
            Some(attempt) => self.log(key, &format!("started attempt {attempt}")),
            None => tracing::debug!(run_id = %self.run_id, step = %key, "step lease not acquired"),
        }
        Ok(attempt)
    }

    pub async fn checkpoint_step_complete(
        &self,
        key: &StepKey,
        kind: StepKind,
        result: &Value,
    ) -> Result<StepCompletion, WorkflowError> {
        let completion = self.repo.complete_step(&self.run_id, key, result).await?;
        if completion == StepCompletion::Applied {
            self.log(key, "checkpointed step complete");
            self.bus.publish(WorkflowEvent::StepSucceeded {
                run_id: self.run_id.clone(),
                step: key.clone(),
                kind,
            });
        }
        Ok(completion)
    }

    pub async fn checkpoint_step_failed(
        &self,
        key: &StepKey,
        failure: &StepFailure,
    ) -> Result<StepCompletion, WorkflowError> {
        let completion = self.repo.fail_step(&self.run_id, key, failure).await?;
        if completion == StepCompletion::Applied {
            tracing::warn!(
                run_id = %self.run_id,
                step = %key,
                error = %failure,
                "checkpointed step failed"
            );
            self.bus.publish(WorkflowEvent::StepFailed {
                run_id: self.run_id.clone(),
                step: key.clone(),
                error: failure.message.clone(),
            });
        }
        Ok(completion)
    }

    /// Record a failed attempt and hand the step to `new_token`.
    pub async fn checkpoint_step_retrying(
        &self,
        key: &StepKey,
        failure: &StepFailure,
        attempt: u32,
        new_token: &str,
        delay: Duration,
    ) -> Result<bool, WorkflowError> {
        let rescheduled = self
            .repo
            .reschedule_step(&self.run_id, key, failure, new_token)
            .await?;
        if rescheduled {
            tracing::warn!(
                run_id = %self.run_id,
                step = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "step attempt failed, retrying"
            );
            self.bus.publish(WorkflowEvent::StepRetrying {
                run_id: self.run_id.clone(),
                step: key.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: failure.message.clone(),
            });
        }
        Ok(rescheduled)
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
