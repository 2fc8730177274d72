//! Step driver: the seam between `WorkflowContext` and durable state.
//!
//! `WorkflowContext` is handed to workflow functions as a plain reference, so
//! it cannot carry the engine's repository and scheduler type parameters.
//! It talks to an object-safe `StepDriver` instead, implemented per
//! invocation by `InvocationDriver`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use waypoint_types::scheduler::PublishRequest;
use waypoint_types::workflow::{
    NotifyResult, RunId, StepCompletion, StepFailure, StepKey, StepKind, StepRecord, Waiter,
    WorkflowRunStatus,
};

use crate::repository::workflow::WorkflowRepository;
use crate::scheduler::DurableScheduler;

use super::checkpoint::CheckpointManager;
use super::engine::EngineShared;
use super::error::WorkflowError;
use super::submitter::{Submission, Submitter};

// ---------------------------------------------------------------------------
// StepDriver trait
// ---------------------------------------------------------------------------

/// Durable operations available to one invocation of one run.
///
/// Object-safe (boxed futures) so `WorkflowContext` can hold it as
/// `Arc<dyn StepDriver>`.
pub trait StepDriver: Send + Sync {
    fn load_step<'a>(&'a self, key: &'a StepKey) -> BoxFuture<'a, Result<Option<StepRecord>, WorkflowError>>;

    /// Insert-if-absent. `false` means another invocation recorded it first.
    fn insert_step<'a>(&'a self, record: &'a StepRecord) -> BoxFuture<'a, Result<bool, WorkflowError>>;

    /// Take the lease of a RUN or NOTIFY step for `token`.
    fn begin_attempt<'a>(
        &'a self,
        key: &'a StepKey,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Option<u32>, WorkflowError>>;

    fn complete_step<'a>(
        &'a self,
        key: &'a StepKey,
        kind: StepKind,
        result: &'a Value,
    ) -> BoxFuture<'a, Result<StepCompletion, WorkflowError>>;

    fn fail_step<'a>(
        &'a self,
        key: &'a StepKey,
        failure: &'a StepFailure,
    ) -> BoxFuture<'a, Result<StepCompletion, WorkflowError>>;

    /// Record a failed attempt and publish the retry owned by `token`.
    fn reschedule_step<'a>(
        &'a self,
        key: &'a StepKey,
        failure: &'a StepFailure,
        attempt: u32,
        token: &'a str,
        delay: Duration,
    ) -> BoxFuture<'a, Result<bool, WorkflowError>>;

    /// Hand newly reached steps to the scheduler.
    ///
    /// Fails with `WorkflowError::Canceled` if the run was canceled.
    fn submit(&self, submissions: Vec<Submission>) -> BoxFuture<'_, Result<(), WorkflowError>>;

    fn notify<'a>(
        &'a self,
        event_id: &'a str,
        data: Value,
    ) -> BoxFuture<'a, Result<Vec<NotifyResult>, WorkflowError>>;

    fn cancel_run(&self) -> BoxFuture<'_, Result<(), WorkflowError>>;
}

// ---------------------------------------------------------------------------
// InvocationDriver
// ---------------------------------------------------------------------------

/// `StepDriver` backed by the engine's repository and scheduler.
pub struct InvocationDriver<R: WorkflowRepository, S: DurableScheduler> {
    shared: Arc<EngineShared<R, S>>,
    checkpoint: CheckpointManager<R>,
    workflow_url: String,
    /// Delivery retries of self-invocations.
    retries: u32,
    lease: Duration,
}

impl<R, S> InvocationDriver<R, S>
where
    R: WorkflowRepository + 'static,
    S: DurableScheduler + 'static,
{
    pub(crate) fn new(
        shared: Arc<EngineShared<R, S>>,
        run_id: RunId,
        workflow_url: String,
        retries: u32,
        lease: Duration,
        verbose: bool,
    ) -> Self {
        let checkpoint = CheckpointManager::new(Arc::clone(&shared.repo), shared.bus.clone(), run_id, verbose);
        Self {
            shared,
            checkpoint,
            workflow_url,
            retries,
            lease,
        }
    }

    fn run_id(&self) -> &RunId {
        self.checkpoint.run_id()
    }

    async fn ensure_not_canceled(&self) -> Result<(), WorkflowError> {
        let run = self.shared.repo.get_run(self.run_id()).await?;
        match run {
            Some(run) if run.status == WorkflowRunStatus::Canceled => Err(WorkflowError::Canceled),
            _ => Ok(()),
        }
    }

    async fn publish_all(&self, submissions: Vec<Submission>) -> Result<(), WorkflowError> {
        if submissions.is_empty() {
            return Ok(());
        }
        self.ensure_not_canceled().await?;

        let repo = &self.shared.repo;
        for submission in &submissions {
            if let Submission::Wait {
                step,
                token,
                event_id,
                timeout_at,
            } = submission
            {
                let waiter = Waiter::pending(
                    self.run_id().clone(),
                    step.clone(),
                    event_id.clone(),
                    *timeout_at,
                    token.clone(),
                );
                repo.create_waiter(&waiter).await?;
            }
        }

        let submitter = Submitter::new(self.run_id(), &self.workflow_url, self.retries);
        let mut requests: Vec<PublishRequest> =
            submissions.iter().map(|s| submitter.for_submission(s)).collect();
        let receipts = if requests.len() == 1 {
            let request = requests.remove(0);
            vec![self.shared.scheduler.publish(request).await?]
        } else {
            self.shared.scheduler.batch_publish(requests).await?
        };

        for receipt in &receipts {
            repo.record_outbound(self.run_id(), &receipt.message_id).await?;
        }
        tracing::debug!(
            run_id = %self.run_id(),
            messages = receipts.len(),
            "published step submissions"
        );
        Ok(())
    }
}

impl<R, S> StepDriver for InvocationDriver<R, S>
where
    R: WorkflowRepository + 'static,
    S: DurableScheduler + 'static,
{
    fn load_step<'a>(&'a self, key: &'a StepKey) -> BoxFuture<'a, Result<Option<StepRecord>, WorkflowError>> {
        Box::pin(self.checkpoint.load_step(key))
    }

    fn insert_step<'a>(&'a self, record: &'a StepRecord) -> BoxFuture<'a, Result<bool, WorkflowError>> {
        Box::pin(self.checkpoint.checkpoint_step_scheduled(record))
    }

    fn begin_attempt<'a>(
        &'a self,
        key: &'a StepKey,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Option<u32>, WorkflowError>> {
        Box::pin(self.checkpoint.checkpoint_attempt_start(key, token, self.lease))
    }

    fn complete_step<'a>(
        &'a self,
        key: &'a StepKey,
        kind: StepKind,
        result: &'a Value,
    ) -> BoxFuture<'a, Result<StepCompletion, WorkflowError>> {
        Box::pin(self.checkpoint.checkpoint_step_complete(key, kind, result))
    }

    fn fail_step<'a>(
        &'a self,
        key: &'a StepKey,
        failure: &'a StepFailure,
    ) -> BoxFuture<'a, Result<StepCompletion, WorkflowError>> {
        Box::pin(self.checkpoint.checkpoint_step_failed(key, failure))
    }

    fn reschedule_step<'a>(
        &'a self,
        key: &'a StepKey,
        failure: &'a StepFailure,
        attempt: u32,
        token: &'a str,
        delay: Duration,
    ) -> BoxFuture<'a, Result<bool, WorkflowError>> {
        Box::pin(async move {
            let rescheduled = self
                .checkpoint
                .checkpoint_step_retrying(key, failure, attempt, token, delay)
                .await?;
            if rescheduled {
                self.publish_all(vec![Submission::Retry {
                    step: key.clone(),
                    token: token.to_string(),
                    delay,
                }])
                .await?;
            }
            Ok(rescheduled)
        })
    }

    fn submit(&self, submissions: Vec<Submission>) -> BoxFuture<'_, Result<(), WorkflowError>> {
        Box::pin(self.publish_all(submissions))
    }

    fn notify<'a>(
        &'a self,
        event_id: &'a str,
        data: Value,
    ) -> BoxFuture<'a, Result<Vec<NotifyResult>, WorkflowError>> {
        Box::pin(async move { Ok(self.shared.notify_waiters(event_id, data).await?) })
    }

    fn cancel_run(&self) -> BoxFuture<'_, Result<(), WorkflowError>> {
        Box::pin(async move {
            self.shared.cancel_run(self.run_id()).await?;
            Ok(())
        })
    }
}
