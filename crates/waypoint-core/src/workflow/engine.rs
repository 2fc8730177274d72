//! Workflow engine: serves invocations of registered workflow endpoints.
//!
//! Every inbound request is one invocation. The engine classifies it, merges
//! what the delivery reports (a wake-up, a call response, a notification)
//! into the run's ledger, then replays the workflow function from the top.
//! The replay either finishes the run, suspends it at unresolved work, or
//! fails it and hands it to the failure handler.
//!
//! # Invocation flow
//!
//! 1. Look up the endpoint and classify the request (init, continuation,
//!    call callback). Drop message ids that were already processed.
//! 2. Init: create the run (insert-if-absent). Continuation: load the run and
//!    merge the delivery into the step it points at.
//! 3. Replay the workflow function with a fresh `WorkflowContext`.
//! 4. Compare-and-set the run to its next status and mark the message id
//!    processed.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use waypoint_types::config::EngineConfig;
use waypoint_types::envelope::{CallbackPayload, Delivery, Envelope, InboundRequest, Invocation, init_token};
use waypoint_types::error::RepositoryError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    FailureContext, NotifyResult, RunId, RunPatch, StepCompletion, StepFailure, StepRecord, Waiter,
    WaiterResolution, WorkflowRun, WorkflowRunStatus,
};

use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;
use crate::scheduler::DurableScheduler;

use super::context::{RunInfo, StepPolicy, WorkflowContext};
use super::driver::InvocationDriver;
use super::error::{EngineError, WorkflowError};
use super::failure::{FailureRoute, url_delivery_response};
use super::checkpoint::lease_deadline;
use super::registry::{RegisteredWorkflow, ResolvedOptions, WorkflowRegistry};
use super::submitter::failure_notice;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What one invocation did to its run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The workflow function returned; the run is SUCCEEDED.
    Completed { run_id: RunId, result: Value },
    /// The replay stopped at unresolved work.
    Suspended { run_id: RunId },
    /// The run failed and its failure handler has run.
    Failed { run_id: RunId },
    Canceled { run_id: RunId },
    /// Nothing to do (duplicate message, settled run, stale delivery).
    Ignored {
        run_id: Option<RunId>,
        reason: &'static str,
    },
}

impl InvocationOutcome {
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            InvocationOutcome::Completed { run_id, .. }
            | InvocationOutcome::Suspended { run_id }
            | InvocationOutcome::Failed { run_id }
            | InvocationOutcome::Canceled { run_id } => Some(run_id),
            InvocationOutcome::Ignored { run_id, .. } => run_id.as_ref(),
        }
    }
}

/// Everything recorded for a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLedger {
    pub run: WorkflowRun,
    pub steps: Vec<StepRecord>,
    pub waiters: Vec<Waiter>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by the engine and every invocation driver.
pub struct EngineShared<R, S> {
    pub(crate) repo: Arc<R>,
    pub(crate) scheduler: Arc<S>,
    pub(crate) registry: WorkflowRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) bus: EventBus,
}

impl<R, S> EngineShared<R, S>
where
    R: WorkflowRepository,
    S: DurableScheduler,
{
    /// Cancel a live run. Returns `false` if the run was not live.
    ///
    /// Pending waiters are dropped and outstanding scheduler messages are
    /// canceled best effort: a message that still arrives finds the run
    /// CANCELED and is ignored.
    pub(crate) async fn cancel_run(&self, run_id: &RunId) -> Result<bool, RepositoryError> {
        let applied = self
            .repo
            .transition_run(
                run_id,
                &WorkflowRunStatus::LIVE,
                WorkflowRunStatus::Canceled,
                RunPatch::none(),
            )
            .await?;
        if !applied {
            return Ok(false);
        }

        let waiters = self.repo.cancel_waiters(run_id).await?;
        let messages = self.repo.outbound_messages(run_id).await?;
        if !messages.is_empty() {
            if let Err(e) = self.scheduler.cancel(&messages).await {
                tracing::warn!(run_id = %run_id, error = %e, "failed to cancel scheduled messages");
            }
        }
        tracing::info!(
            run_id = %run_id,
            waiters,
            messages = messages.len(),
            "workflow run canceled"
        );
        self.bus.publish(WorkflowEvent::RunCanceled {
            run_id: run_id.clone(),
        });
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Serves workflow endpoints on top of a repository and a durable scheduler.
///
/// Generic over the storage backend and the scheduler so the same engine runs
/// against SQLite and a real scheduler in production and in-memory doubles in
/// tests. Cheap to clone.
pub struct WorkflowEngine<R, S> {
    shared: Arc<EngineShared<R, S>>,
}

impl<R, S> Clone for WorkflowEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R, S> WorkflowEngine<R, S>
where
    R: WorkflowRepository + 'static,
    S: DurableScheduler + 'static,
{
    pub fn new(repo: Arc<R>, scheduler: Arc<S>, registry: WorkflowRegistry, config: EngineConfig) -> Self {
        Self::with_event_bus(repo, scheduler, registry, config, EventBus::default())
    }

    pub fn with_event_bus(
        repo: Arc<R>,
        scheduler: Arc<S>,
        registry: WorkflowRegistry,
        config: EngineConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                repo,
                scheduler,
                registry,
                config,
                bus,
            }),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.shared.repo
    }

    pub fn scheduler(&self) -> &Arc<S> {
        &self.shared.scheduler
    }

    // -----------------------------------------------------------------------
    // Invocations
    // -----------------------------------------------------------------------

    /// Handle one request to the endpoint of workflow `name`.
    pub async fn handle(&self, name: &str, request: InboundRequest) -> Result<InvocationOutcome, EngineError> {
        let workflow = self
            .shared
            .registry
            .get(name)
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;
        let invocation = request.classify()?;
        let message_id = request.message_id().map(str::to_string);

        if let Some(message_id) = message_id.as_deref() {
            if self.shared.repo.is_processed(message_id).await? {
                tracing::debug!(message_id, workflow = name, "dropping duplicate message");
                return Ok(InvocationOutcome::Ignored {
                    run_id: None,
                    reason: "duplicate message",
                });
            }
        }

        let url = workflow.endpoint_url(self.shared.config.base_url.as_deref(), &request.url);
        let options = ResolvedOptions::resolve(&workflow.options, &self.shared.config);
        let outcome = match invocation {
            Invocation::Init { run_id } => {
                self.start(&workflow, &options, run_id, url, request.body).await?
            }
            Invocation::Continuation(envelope) => {
                self.continue_run(&workflow, &options, envelope, None).await?
            }
            Invocation::Callback {
                envelope,
                payload,
                failure,
            } => {
                self.continue_run(&workflow, &options, envelope, Some((payload, failure)))
                    .await?
            }
        };

        if let Some(message_id) = message_id.as_deref() {
            self.shared
                .repo
                .mark_processed(message_id, outcome.run_id())
                .await?;
        }
        Ok(outcome)
    }

    async fn start(
        &self,
        workflow: &RegisteredWorkflow,
        options: &ResolvedOptions,
        run_id: Option<RunId>,
        url: String,
        payload: Vec<u8>,
    ) -> Result<InvocationOutcome, EngineError> {
        let run = WorkflowRun::new(run_id.unwrap_or_default(), &workflow.name, url, payload);
        if self.shared.repo.create_run(&run).await? {
            tracing::info!(run_id = %run.run_id, workflow = %workflow.name, "workflow run started");
            self.shared.bus.publish(WorkflowEvent::RunStarted {
                run_id: run.run_id.clone(),
                workflow: workflow.name.clone(),
            });
            return self.execute(workflow, options, &run, init_token(&run.run_id)).await;
        }

        let existing = self
            .shared
            .repo
            .get_run(&run.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))?;
        match existing.status {
            // Redelivered trigger of a run that crashed mid-invocation.
            status if status.is_live() => {
                tracing::debug!(run_id = %existing.run_id, "replaying redelivered trigger");
                self.execute(workflow, options, &existing, init_token(&existing.run_id))
                    .await
            }
            WorkflowRunStatus::FailedPendingCallback => self.settle_failure(options, &existing).await,
            _ => Ok(InvocationOutcome::Ignored {
                run_id: Some(existing.run_id),
                reason: "run already exists",
            }),
        }
    }

    async fn continue_run(
        &self,
        workflow: &RegisteredWorkflow,
        options: &ResolvedOptions,
        envelope: Envelope,
        callback: Option<(CallbackPayload, bool)>,
    ) -> Result<InvocationOutcome, EngineError> {
        let run = self
            .shared
            .repo
            .get_run(&envelope.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(envelope.run_id.clone()))?;

        if run.workflow_name != workflow.name {
            tracing::warn!(
                run_id = %run.run_id,
                run_workflow = %run.workflow_name,
                endpoint = %workflow.name,
                "delivery sent to the wrong workflow endpoint"
            );
            return Ok(InvocationOutcome::Ignored {
                run_id: Some(run.run_id),
                reason: "run belongs to another workflow",
            });
        }

        match run.status {
            WorkflowRunStatus::FailedPendingCallback => self.settle_failure(options, &run).await,
            status if status.is_terminal() => {
                tracing::debug!(run_id = %run.run_id, status = %status, "ignoring delivery for settled run");
                Ok(InvocationOutcome::Ignored {
                    run_id: Some(run.run_id),
                    reason: "run is settled",
                })
            }
            _ => {
                self.merge(&run, &envelope, callback).await?;
                self.shared
                    .repo
                    .transition_run(
                        &run.run_id,
                        &[WorkflowRunStatus::Waiting],
                        WorkflowRunStatus::Running,
                        RunPatch::none(),
                    )
                    .await?;
                self.execute(workflow, options, &run, envelope.token).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Merging deliveries
    // -----------------------------------------------------------------------

    /// Record what the delivery reports onto the step it points at.
    async fn merge(
        &self,
        run: &WorkflowRun,
        envelope: &Envelope,
        callback: Option<(CallbackPayload, bool)>,
    ) -> Result<(), EngineError> {
        let key = match &envelope.delivery {
            Delivery::Wake { step }
            | Delivery::WaitTimeout { step }
            | Delivery::Notified { step }
            | Delivery::CallResult { step } => step,
            Delivery::Resume | Delivery::Retry { .. } | Delivery::Branch { .. } => return Ok(()),
        };

        let repo = &self.shared.repo;
        let Some(step) = repo.get_step(&run.run_id, key).await? else {
            tracing::warn!(run_id = %run.run_id, step = %key, "delivery for unknown step");
            return Ok(());
        };
        if step.status.is_terminal() {
            return Ok(());
        }
        if step.owner_token != envelope.token {
            tracing::warn!(
                run_id = %run.run_id,
                step = %key,
                delivery = envelope.delivery.label(),
                "ignoring delivery with stale token"
            );
            return Ok(());
        }

        match &envelope.delivery {
            Delivery::Wake { .. } => {
                self.complete(&run.run_id, &step, &Value::Null).await?;
            }
            Delivery::WaitTimeout { .. } => {
                let timed_out = repo
                    .resolve_waiter(&run.run_id, key, WaiterResolution::TimedOut)
                    .await?;
                if let Some(waiter) = timed_out {
                    self.shared.bus.publish(WorkflowEvent::WaiterTimedOut {
                        run_id: run.run_id.clone(),
                        event_id: waiter.event_id,
                    });
                }
                self.settle_wait(run, &step).await?;
            }
            Delivery::Notified { .. } => {
                self.settle_wait(run, &step).await?;
            }
            Delivery::CallResult { .. } => {
                let Some((payload, failure_callback)) = callback else {
                    tracing::warn!(run_id = %run.run_id, step = %key, "call result without callback payload");
                    return Ok(());
                };
                let response = payload.into_response();
                if response.is_success() && !failure_callback {
                    let value = serde_json::to_value(&response)
                        .map_err(|e| RepositoryError::Query(e.to_string()))?;
                    self.complete(&run.run_id, &step, &value).await?;
                } else {
                    let failure = StepFailure::from_response(&response);
                    if repo.fail_step(&run.run_id, key, &failure).await?
                        == StepCompletion::Applied
                    {
                        tracing::warn!(
                            run_id = %run.run_id,
                            step = %key,
                            status = response.status,
                            "call step failed"
                        );
                        self.shared.bus.publish(WorkflowEvent::StepFailed {
                            run_id: run.run_id.clone(),
                            step: key.clone(),
                            error: failure.message,
                        });
                    }
                }
            }
            Delivery::Resume | Delivery::Retry { .. } | Delivery::Branch { .. } => {}
        }
        Ok(())
    }

    /// Settle a WAIT_FOR_EVENT step from its waiter's final state.
    async fn settle_wait(&self, run: &WorkflowRun, step: &StepRecord) -> Result<(), EngineError> {
        let waiter = self.shared.repo.get_waiter(&run.run_id, &step.key).await?;
        if let Some(outcome) = waiter.as_ref().and_then(Waiter::outcome) {
            let value =
                serde_json::to_value(&outcome).map_err(|e| RepositoryError::Query(e.to_string()))?;
            self.complete(&run.run_id, step, &value).await?;
        }
        Ok(())
    }

    async fn complete(&self, run_id: &RunId, step: &StepRecord, value: &Value) -> Result<(), EngineError> {
        let completion = self.shared.repo.complete_step(run_id, &step.key, value).await?;
        if completion == StepCompletion::Applied {
            tracing::debug!(run_id = %run_id, step = %step.key, kind = %step.kind(), "step settled by delivery");
            self.shared.bus.publish(WorkflowEvent::StepSucceeded {
                run_id: run_id.clone(),
                step: step.key.clone(),
                kind: step.kind(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    async fn execute(
        &self,
        workflow: &RegisteredWorkflow,
        options: &ResolvedOptions,
        run: &WorkflowRun,
        token: String,
    ) -> Result<InvocationOutcome, EngineError> {
        let run_id = run.run_id.clone();
        let ledger = self.shared.repo.load_ledger(&run_id).await?;
        let driver = InvocationDriver::new(
            Arc::clone(&self.shared),
            run_id.clone(),
            run.workflow_url.clone(),
            options.retries,
            options.lease,
            options.verbose,
        );
        let policy = StepPolicy {
            retries: options.retries,
            backoff: options.backoff,
            wait_timeout: options.wait_timeout,
        };
        let ctx = WorkflowContext::new(RunInfo::from(run), token, policy, Arc::new(driver), ledger);

        let returned = workflow.function.call(&ctx).await;
        let result = match ctx.halted() {
            Some(halt) => Err(halt.into_error()),
            None => returned,
        };

        match result {
            Ok(value) => self.succeed(&run_id, value).await,
            Err(WorkflowError::Suspended) => {
                self.shared
                    .repo
                    .transition_run(
                        &run_id,
                        &[WorkflowRunStatus::Running],
                        WorkflowRunStatus::Waiting,
                        RunPatch::none(),
                    )
                    .await?;
                if options.verbose {
                    tracing::info!(run_id = %run_id, "workflow run suspended");
                } else {
                    tracing::debug!(run_id = %run_id, "workflow run suspended");
                }
                self.shared.bus.publish(WorkflowEvent::RunSuspended { run_id: run_id.clone() });
                Ok(InvocationOutcome::Suspended { run_id })
            }
            Err(WorkflowError::Canceled) => Ok(InvocationOutcome::Canceled { run_id }),
            Err(err) if err.is_control_flow() || err.is_infrastructure() => {
                Err(EngineError::from_workflow(&run_id, err))
            }
            Err(err) => self.fail(options, run, err).await,
        }
    }

    async fn succeed(&self, run_id: &RunId, value: Value) -> Result<InvocationOutcome, EngineError> {
        let applied = self
            .shared
            .repo
            .transition_run(
                run_id,
                &WorkflowRunStatus::LIVE,
                WorkflowRunStatus::Succeeded,
                RunPatch::result(value.clone()),
            )
            .await?;
        if applied {
            tracing::info!(run_id = %run_id, "workflow run succeeded");
            self.shared.bus.publish(WorkflowEvent::RunSucceeded { run_id: run_id.clone() });
            return Ok(InvocationOutcome::Completed {
                run_id: run_id.clone(),
                result: value,
            });
        }

        // Lost the race: another branch finished the run, or it was canceled.
        let current = self.shared.repo.get_run(run_id).await?;
        Ok(match current {
            Some(run) if run.status == WorkflowRunStatus::Canceled => {
                InvocationOutcome::Canceled { run_id: run.run_id }
            }
            Some(run) if run.status == WorkflowRunStatus::Succeeded => InvocationOutcome::Completed {
                run_id: run.run_id,
                result: run.result.unwrap_or(Value::Null),
            },
            _ => InvocationOutcome::Ignored {
                run_id: Some(run_id.clone()),
                reason: "run already settled",
            },
        })
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    async fn fail(
        &self,
        options: &ResolvedOptions,
        run: &WorkflowRun,
        err: WorkflowError,
    ) -> Result<InvocationOutcome, EngineError> {
        let (step, failure) = err.failure();
        let context = FailureContext::from_step(run.run_id.clone(), &run.workflow_url, step, &failure);
        let applied = self
            .shared
            .repo
            .transition_run(
                &run.run_id,
                &WorkflowRunStatus::LIVE,
                WorkflowRunStatus::FailedPendingCallback,
                RunPatch::failure(context),
            )
            .await?;
        if applied {
            tracing::warn!(run_id = %run.run_id, error = %err, "workflow run failed");
            self.shared.bus.publish(WorkflowEvent::RunFailed {
                run_id: run.run_id.clone(),
                error: failure.message.clone(),
            });
        }

        let current = self
            .shared
            .repo
            .get_run(&run.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))?;
        match current.status {
            WorkflowRunStatus::FailedPendingCallback => self.settle_failure(options, &current).await,
            WorkflowRunStatus::Canceled => Ok(InvocationOutcome::Canceled { run_id: current.run_id }),
            _ => Ok(InvocationOutcome::Ignored {
                run_id: Some(current.run_id),
                reason: "run already settled",
            }),
        }
    }

    /// Run the failure handler of a FAILED_PENDING_CALLBACK run.
    ///
    /// The handler runs under a lease on the run, so concurrent deliveries
    /// invoke it once. The run moves to FAILED once the failure function
    /// returned or the failure URL message was accepted. On error the lease
    /// is released, the run stays pending and the error is returned so the
    /// delivery is retried.
    async fn settle_failure(
        &self,
        options: &ResolvedOptions,
        run: &WorkflowRun,
    ) -> Result<InvocationOutcome, EngineError> {
        let lease_until = lease_deadline(Utc::now(), options.lease);
        if !self.shared.repo.claim_failure_handler(&run.run_id, lease_until).await? {
            let current = self
                .shared
                .repo
                .get_run(&run.run_id)
                .await?
                .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))?;
            if current.status == WorkflowRunStatus::FailedPendingCallback {
                tracing::debug!(run_id = %run.run_id, "failure handler already running");
                return Err(EngineError::FailureHandlerBusy(current.run_id));
            }
            return Ok(InvocationOutcome::Ignored {
                run_id: Some(current.run_id),
                reason: "failure already handled",
            });
        }

        match self.run_failure_handler(options, run).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.shared.repo.release_failure_handler(&run.run_id).await?;
                Err(e)
            }
        }
    }

    async fn run_failure_handler(
        &self,
        options: &ResolvedOptions,
        run: &WorkflowRun,
    ) -> Result<InvocationOutcome, EngineError> {
        let failure = run.failure.clone().unwrap_or_else(|| {
            FailureContext::from_step(
                run.run_id.clone(),
                &run.workflow_url,
                None,
                &StepFailure::message("workflow failed"),
            )
        });

        let route = FailureRoute::select(options.failure_function.is_some(), options.failure_url.as_deref());
        let response = match (route, &options.failure_function) {
            (FailureRoute::Function, Some(function)) => function
                .on_failure(&failure)
                .await
                .map_err(|e| EngineError::FailureCallback(format!("{e:#}")))?,
            (FailureRoute::Url(url), _) => {
                let receipt = self
                    .shared
                    .scheduler
                    .publish(failure_notice(&url, &failure, options.retries))
                    .await
                    .map_err(|e| EngineError::FailureCallback(e.to_string()))?;
                self.shared
                    .repo
                    .record_outbound(&run.run_id, &receipt.message_id)
                    .await?;
                Some(url_delivery_response(&url, &receipt.message_id))
            }
            _ => None,
        };

        let patch = match response {
            Some(value) => RunPatch::failure_response(value),
            None => RunPatch::none(),
        };
        self.shared
            .repo
            .transition_run(
                &run.run_id,
                &[WorkflowRunStatus::FailedPendingCallback],
                WorkflowRunStatus::Failed,
                patch,
            )
            .await?;
        tracing::info!(run_id = %run.run_id, status = failure.status, "failure handler completed");
        Ok(InvocationOutcome::Failed {
            run_id: run.run_id.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Resume every run waiting for `event_id` with `data`.
    pub async fn notify(&self, event_id: &str, data: Value) -> Result<Vec<NotifyResult>, EngineError> {
        Ok(self.shared.notify_waiters(event_id, data).await?)
    }

    /// Cancel a live run. Returns `false` if it was already settled.
    pub async fn cancel(&self, run_id: &RunId) -> Result<bool, EngineError> {
        if self.shared.repo.get_run(run_id).await?.is_none() {
            return Err(EngineError::RunNotFound(run_id.clone()));
        }
        Ok(self.shared.cancel_run(run_id).await?)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, EngineError> {
        Ok(self.shared.repo.get_run(run_id).await?)
    }

    pub async fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.shared.repo.list_runs(status, limit).await?)
    }

    /// The run with its step ledger and waiters.
    pub async fn ledger(&self, run_id: &RunId) -> Result<RunLedger, EngineError> {
        let run = self
            .shared
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;
        let steps = self.shared.repo.load_ledger(run_id).await?;
        let waiters = self.shared.repo.list_waiters(run_id).await?;
        Ok(RunLedger { run, steps, waiters })
    }

    /// Delete settled runs completed more than `retention_days` ago.
    pub async fn purge(&self, retention_days: u32) -> Result<u64, EngineError> {
        let older_than = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let purged = self.shared.repo.purge_runs(older_than).await?;
        if purged > 0 {
            tracing::info!(purged, retention_days, "purged settled workflow runs");
        }
        Ok(purged)
    }
}
