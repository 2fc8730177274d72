//! The handle workflow functions use to reach steps.
//!
//! A workflow function is replayed from the top on every invocation. Each
//! step primitive looks its position up in the run's ledger: a settled step
//! returns its memoized result without running anything, an unsettled step
//! either runs here (RUN and NOTIFY, under a lease) or suspends the
//! invocation until the scheduler delivers what it is waiting for.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use waypoint_types::config::BackoffConfig;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    BatchMembership, CallRequest, CallResponse, NotifyResult, RunId, StepCompletion, StepDetail,
    StepFailure, StepKey, StepKind, StepRecord, StepStatus, WaitEventResult, WorkflowRun,
};

use super::driver::StepDriver;
use super::error::WorkflowError;
use super::ledger::{Ledger, derive_token, retry_token};
use super::retry::{RetryAction, RetryHandler};
use super::submitter::Submission;

// ---------------------------------------------------------------------------
// Invocation state
// ---------------------------------------------------------------------------

/// Identity and trigger payload of the run being replayed.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: RunId,
    pub workflow_name: String,
    pub workflow_url: String,
    pub payload: Value,
    pub raw_payload: Vec<u8>,
}

impl From<&WorkflowRun> for RunInfo {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            workflow_url: run.workflow_url.clone(),
            payload: run.payload.clone(),
            raw_payload: run.raw_payload.clone(),
        }
    }
}

/// Step settings resolved for the endpoint.
#[derive(Debug, Clone, Copy)]
pub struct StepPolicy {
    pub retries: u32,
    pub backoff: BackoffConfig,
    pub wait_timeout: Duration,
}

/// Why an invocation stopped early.
///
/// Recorded on the context so the engine sees it even when workflow code
/// swallows the corresponding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Suspended,
    Busy(StepKey),
    Canceled,
}

impl Halt {
    fn rank(&self) -> u8 {
        match self {
            Halt::Suspended => 0,
            Halt::Busy(_) => 1,
            Halt::Canceled => 2,
        }
    }

    pub fn into_error(self) -> WorkflowError {
        match self {
            Halt::Suspended => WorkflowError::Suspended,
            Halt::Busy(step) => WorkflowError::Busy { step },
            Halt::Canceled => WorkflowError::Canceled,
        }
    }
}

struct ReplayState {
    ledger: Ledger,
    halt: Option<Halt>,
}

enum Reached {
    Created(StepRecord),
    Existing(StepRecord),
}

impl Reached {
    fn record(&self) -> &StepRecord {
        match self {
            Reached::Created(record) | Reached::Existing(record) => record,
        }
    }
}

/// Outcome of driving one attempt of a RUN step.
enum Attempt {
    Done(Value),
    Failed(StepFailure),
    /// Another attempt is scheduled, or the step belongs to another delivery.
    Deferred,
}

type RunFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<Value>> + Send + 'a>;

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Passed by reference to workflow functions.
///
/// Step primitives return `WorkflowError::Suspended`, `Busy` or `Canceled`
/// when the invocation has to stop; propagate them with `?`.
pub struct WorkflowContext {
    run: RunInfo,
    /// Delivery token of the current invocation.
    token: String,
    policy: StepPolicy,
    driver: Arc<dyn StepDriver>,
    state: Mutex<ReplayState>,
}

impl WorkflowContext {
    pub fn new(
        run: RunInfo,
        token: impl Into<String>,
        policy: StepPolicy,
        driver: Arc<dyn StepDriver>,
        ledger: Vec<StepRecord>,
    ) -> Self {
        Self {
            run,
            token: token.into(),
            policy,
            driver,
            state: Mutex::new(ReplayState {
                ledger: Ledger::new(ledger),
                halt: None,
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.run.workflow_name
    }

    pub fn workflow_url(&self) -> &str {
        &self.run.workflow_url
    }

    /// Trigger payload parsed as JSON.
    pub fn payload(&self) -> &Value {
        &self.run.payload
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        Ok(serde_json::from_value(self.run.payload.clone())?)
    }

    pub fn raw_payload(&self) -> &[u8] {
        &self.run.raw_payload
    }

    /// Why this invocation stopped early, if it did.
    pub fn halted(&self) -> Option<Halt> {
        self.state().halt.clone()
    }

    // -----------------------------------------------------------------------
    // Step primitives
    // -----------------------------------------------------------------------

    /// Run `f` once and memoize its result under `name`.
    ///
    /// A failing body is retried with exponential backoff in a later
    /// invocation. Once retries are exhausted the step fails terminally and
    /// every replay returns `WorkflowError::StepFailed`.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let key = self.next_key(name);
        let reached = self.reach(&key, StepDetail::Run, None).await?;
        let record = reached.record();
        if let Some(settled) = settled(record) {
            return settled;
        }
        if !self.owns(record) {
            return Err(self.halt(Halt::Suspended));
        }

        let body = || async move {
            let value = f().await?;
            Ok::<Value, anyhow::Error>(serde_json::to_value(value)?)
        };
        match self.attempt(record, body).await? {
            Attempt::Done(value) => decode(value),
            Attempt::Failed(failure) => Err(WorkflowError::StepFailed { step: key, failure }),
            Attempt::Deferred => Err(self.halt(Halt::Suspended)),
        }
    }

    /// Suspend the run for `duration`.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), WorkflowError> {
        let key = self.next_key(name);
        let wake_at = deadline(Utc::now(), duration);
        let reached = self.reach(&key, StepDetail::Sleep { wake_at }, None).await?;
        self.await_external(reached).await
    }

    /// Suspend the run until `wake_at`.
    pub async fn sleep_until(&self, name: &str, wake_at: DateTime<Utc>) -> Result<(), WorkflowError> {
        let key = self.next_key(name);
        let reached = self.reach(&key, StepDetail::SleepUntil { wake_at }, None).await?;
        self.await_external(reached).await
    }

    /// Make an HTTP request through the durable scheduler.
    ///
    /// Any response is delivered back; a non-2xx response fails the step.
    pub async fn call(&self, name: &str, request: CallRequest) -> Result<CallResponse, WorkflowError> {
        let key = self.next_key(name);
        let reached = self.reach(&key, StepDetail::Call { request }, None).await?;
        self.await_external(reached).await
    }

    /// Suspend until `event_id` is notified or `timeout` elapses.
    ///
    /// `timeout` defaults to the endpoint's wait timeout.
    pub async fn wait_for_event(
        &self,
        name: &str,
        event_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitEventResult, WorkflowError> {
        let key = self.next_key(name);
        let timeout_at = deadline(Utc::now(), timeout.unwrap_or(self.policy.wait_timeout));
        let detail = StepDetail::WaitForEvent {
            event_id: event_id.to_string(),
            timeout_at,
        };
        let reached = self.reach(&key, detail, None).await?;
        self.await_external(reached).await
    }

    /// Resume every run currently waiting for `event_id` with `data`.
    pub async fn notify(
        &self,
        name: &str,
        event_id: &str,
        data: Value,
    ) -> Result<Vec<NotifyResult>, WorkflowError> {
        let key = self.next_key(name);
        let detail = StepDetail::Notify {
            event_id: event_id.to_string(),
        };
        let reached = self.reach(&key, detail, None).await?;
        let record = reached.record();
        if let Some(settled) = settled(record) {
            return settled;
        }
        if !self.owns(record) {
            return Err(self.halt(Halt::Suspended));
        }

        if self.driver.begin_attempt(&key, &record.owner_token).await?.is_none() {
            return match self.lease_not_acquired(record).await? {
                Attempt::Done(value) => decode(value),
                Attempt::Failed(failure) => Err(WorkflowError::StepFailed { step: key, failure }),
                Attempt::Deferred => Err(self.halt(Halt::Suspended)),
            };
        }
        let results = self.driver.notify(event_id, data).await?;
        let value = serde_json::to_value(&results)?;
        self.driver.complete_step(&key, StepKind::Notify, &value).await?;
        Ok(results)
    }

    /// Cancel this run. Always returns `WorkflowError::Canceled`.
    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.driver.cancel_run().await?;
        Err(self.halt(Halt::Canceled))
    }

    /// Reach every member of `batch` at once and join on all of them.
    ///
    /// RUN members execute in their own invocations. Results are returned in
    /// member order; if any member failed, the first failed member (by
    /// position) is raised once every member is settled.
    pub async fn parallel(&self, batch: ParallelBatch<'_>) -> Result<Vec<Value>, WorkflowError> {
        let batch_key = self.next_key(&batch.name);
        let size = batch.members.len() as u32;
        let now = Utc::now();

        let mut records = Vec::with_capacity(batch.members.len());
        let mut bodies = Vec::with_capacity(batch.members.len());
        let mut submissions = Vec::new();
        for (index, member) in batch.members.into_iter().enumerate() {
            let (name, detail, body) = member.into_parts(now, self.policy.wait_timeout);
            let key = self.next_key(&name);
            let membership = BatchMembership {
                batch: batch_key.clone(),
                index: index as u32,
                size,
            };
            let reached = self.reach(&key, detail, Some(membership)).await?;
            let record = match reached {
                Reached::Created(record) => {
                    submissions.extend(submission_for(&record));
                    record
                }
                Reached::Existing(record) => {
                    if record.status == StepStatus::Pending && self.is_creator(&record) {
                        submissions.extend(submission_for(&record));
                    }
                    record
                }
            };
            records.push(record);
            bodies.push(body);
        }
        self.submit(submissions).await?;

        // A branch or retry delivery executes the member it owns.
        for (record, body) in records.iter_mut().zip(bodies) {
            let Some(body) = body else { continue };
            if record.status != StepStatus::Pending || record.owner_token != self.token {
                continue;
            }
            match self.attempt(record, body).await? {
                Attempt::Done(value) => {
                    record.status = StepStatus::Succeeded;
                    record.result = Some(value);
                }
                Attempt::Failed(failure) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(failure);
                }
                Attempt::Deferred => {}
            }
        }

        // Re-read unsettled members: another branch may have settled them.
        for record in records.iter_mut().filter(|r| r.status == StepStatus::Pending) {
            if let Some(fresh) = self.driver.load_step(&record.key).await? {
                *record = fresh;
            }
        }
        if records.iter().any(|r| r.status == StepStatus::Pending) {
            return Err(self.halt(Halt::Suspended));
        }
        if let Some(failed) = records.iter().find(|r| r.status == StepStatus::Failed) {
            return Err(step_failed(failed));
        }
        Ok(records
            .into_iter()
            .map(|r| r.result.unwrap_or(Value::Null))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Replay bookkeeping
    // -----------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_key(&self, name: &str) -> StepKey {
        self.state().ledger.next_key(name)
    }

    fn recorded(&self, key: &StepKey, reached: StepKind) -> Result<Option<StepRecord>, WorkflowError> {
        let state = self.state();
        match state.ledger.get(key) {
            Some(record) => {
                check_kind(record, reached)?;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    fn remember(&self, record: StepRecord) {
        self.state().ledger.upsert(record);
    }

    fn halt(&self, halt: Halt) -> WorkflowError {
        let err = halt.clone().into_error();
        let mut state = self.state();
        let replace = state
            .halt
            .as_ref()
            .is_none_or(|current| halt.rank() > current.rank());
        if replace {
            state.halt = Some(halt);
        }
        err
    }

    /// Record control-flow errors coming back from the driver.
    fn control(&self, err: WorkflowError) -> WorkflowError {
        match err {
            WorkflowError::Suspended => self.halt(Halt::Suspended),
            WorkflowError::Busy { step } => self.halt(Halt::Busy(step)),
            WorkflowError::Canceled => self.halt(Halt::Canceled),
            other => other,
        }
    }

    /// Whether this invocation created the step (it derived the owner token).
    fn is_creator(&self, record: &StepRecord) -> bool {
        record.owner_token == derive_token(&self.token, &record.key)
    }

    /// Whether this invocation may execute a single (non-batch) step body.
    fn owns(&self, record: &StepRecord) -> bool {
        record.owner_token == self.token || self.is_creator(record)
    }

    async fn submit(&self, submissions: Vec<Submission>) -> Result<(), WorkflowError> {
        if submissions.is_empty() {
            return Ok(());
        }
        self.driver
            .submit(submissions)
            .await
            .map_err(|err| self.control(err))
    }

    /// Find the record at `key`, creating it (owned by a token derived from
    /// this delivery) if this is the first time the step is reached.
    async fn reach(
        &self,
        key: &StepKey,
        detail: StepDetail,
        batch: Option<BatchMembership>,
    ) -> Result<Reached, WorkflowError> {
        let kind = detail.kind();
        if let Some(record) = self.recorded(key, kind)? {
            return Ok(Reached::Existing(record));
        }

        let owner = derive_token(&self.token, key);
        let mut record = StepRecord::pending(self.run.run_id.clone(), key.clone(), detail, owner);
        if let Some(batch) = batch {
            record = record.with_batch(batch);
        }
        if self.driver.insert_step(&record).await? {
            self.remember(record.clone());
            return Ok(Reached::Created(record));
        }

        let record = self
            .driver
            .load_step(key)
            .await?
            .ok_or(WorkflowError::Repository(RepositoryError::NotFound))?;
        check_kind(&record, kind)?;
        self.remember(record.clone());
        Ok(Reached::Existing(record))
    }

    /// Settle or suspend on a step resolved by a scheduler delivery.
    async fn await_external<T: DeserializeOwned>(&self, reached: Reached) -> Result<T, WorkflowError> {
        match reached {
            Reached::Created(record) => {
                self.submit(submission_for(&record).into_iter().collect()).await?;
            }
            Reached::Existing(record) => {
                if let Some(settled) = settled(&record) {
                    return settled;
                }
                // Redelivered creator: the first publish may have been lost.
                if self.is_creator(&record) {
                    self.submit(submission_for(&record).into_iter().collect()).await?;
                }
            }
        }
        Err(self.halt(Halt::Suspended))
    }

    /// Drive one attempt of a step body under the step lease.
    async fn attempt<F, Fut>(&self, record: &StepRecord, body: F) -> Result<Attempt, WorkflowError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let key = &record.key;
        let owner = &record.owner_token;
        let Some(attempt) = self.driver.begin_attempt(key, owner).await? else {
            return self.lease_not_acquired(record).await;
        };

        match body().await {
            Ok(value) => match self.driver.complete_step(key, StepKind::Run, &value).await? {
                StepCompletion::Applied => Ok(Attempt::Done(value)),
                StepCompletion::AlreadyTerminal => self.reload_attempt(key).await,
            },
            Err(err) => {
                let err = WorkflowError::from(err);
                if err.is_control_flow() {
                    return Err(self.control(err));
                }
                let failure = StepFailure::message(err.to_string());
                match RetryHandler::decide(self.policy.retries, &self.policy.backoff, attempt) {
                    RetryAction::Retry { delay } => {
                        let next = retry_token(owner, key, attempt);
                        self.driver
                            .reschedule_step(key, &failure, attempt, &next, delay)
                            .await
                            .map_err(|err| self.control(err))?;
                        Ok(Attempt::Deferred)
                    }
                    RetryAction::GiveUp => match self.driver.fail_step(key, &failure).await? {
                        StepCompletion::Applied => Ok(Attempt::Failed(failure)),
                        StepCompletion::AlreadyTerminal => self.reload_attempt(key).await,
                    },
                }
            }
        }
    }

    /// The lease was refused: the step settled, moved to another token, or
    /// is being executed right now.
    async fn lease_not_acquired(&self, record: &StepRecord) -> Result<Attempt, WorkflowError> {
        let Some(fresh) = self.driver.load_step(&record.key).await? else {
            return Err(WorkflowError::Repository(RepositoryError::NotFound));
        };
        match fresh.status {
            StepStatus::Succeeded => Ok(Attempt::Done(fresh.result.unwrap_or(Value::Null))),
            StepStatus::Failed => Ok(Attempt::Failed(failure_of(&fresh))),
            StepStatus::Pending if fresh.owner_token != record.owner_token => Ok(Attempt::Deferred),
            StepStatus::Pending => Err(self.halt(Halt::Busy(record.key.clone()))),
        }
    }

    async fn reload_attempt(&self, key: &StepKey) -> Result<Attempt, WorkflowError> {
        match self.driver.load_step(key).await? {
            Some(fresh) if fresh.status == StepStatus::Succeeded => {
                Ok(Attempt::Done(fresh.result.unwrap_or(Value::Null)))
            }
            Some(fresh) if fresh.status == StepStatus::Failed => Ok(Attempt::Failed(failure_of(&fresh))),
            _ => Ok(Attempt::Deferred),
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelBatch
// ---------------------------------------------------------------------------

enum Member<'a> {
    Run { name: String, body: RunFn<'a> },
    Sleep { name: String, duration: Duration },
    SleepUntil { name: String, wake_at: DateTime<Utc> },
    Call { name: String, request: CallRequest },
    Wait {
        name: String,
        event_id: String,
        timeout: Option<Duration>,
    },
}

impl<'a> Member<'a> {
    fn into_parts(self, now: DateTime<Utc>, wait_timeout: Duration) -> (String, StepDetail, Option<RunFn<'a>>) {
        match self {
            Member::Run { name, body } => (name, StepDetail::Run, Some(body)),
            Member::Sleep { name, duration } => (
                name,
                StepDetail::Sleep {
                    wake_at: deadline(now, duration),
                },
                None,
            ),
            Member::SleepUntil { name, wake_at } => (name, StepDetail::SleepUntil { wake_at }, None),
            Member::Call { name, request } => (name, StepDetail::Call { request }, None),
            Member::Wait {
                name,
                event_id,
                timeout,
            } => (
                name,
                StepDetail::WaitForEvent {
                    event_id,
                    timeout_at: deadline(now, timeout.unwrap_or(wait_timeout)),
                },
                None,
            ),
        }
    }
}

/// Steps reached together by `WorkflowContext::parallel`.
pub struct ParallelBatch<'a> {
    name: String,
    members: Vec<Member<'a>>,
}

impl<'a> ParallelBatch<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn run<T, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        T: Serialize + Send + 'a,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        let body: RunFn<'a> = Box::new(move || {
            Box::pin(async move {
                let value = f().await?;
                Ok::<Value, anyhow::Error>(serde_json::to_value(value)?)
            })
        });
        self.members.push(Member::Run {
            name: name.into(),
            body,
        });
        self
    }

    pub fn sleep(mut self, name: impl Into<String>, duration: Duration) -> Self {
        self.members.push(Member::Sleep {
            name: name.into(),
            duration,
        });
        self
    }

    pub fn sleep_until(mut self, name: impl Into<String>, wake_at: DateTime<Utc>) -> Self {
        self.members.push(Member::SleepUntil {
            name: name.into(),
            wake_at,
        });
        self
    }

    pub fn call(mut self, name: impl Into<String>, request: CallRequest) -> Self {
        self.members.push(Member::Call {
            name: name.into(),
            request,
        });
        self
    }

    pub fn wait_for_event(
        mut self,
        name: impl Into<String>,
        event_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        self.members.push(Member::Wait {
            name: name.into(),
            event_id: event_id.into(),
            timeout,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| now.checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, WorkflowError> {
    Ok(serde_json::from_value(value)?)
}

fn check_kind(record: &StepRecord, reached: StepKind) -> Result<(), WorkflowError> {
    if record.kind() == reached {
        Ok(())
    } else {
        Err(WorkflowError::LedgerMismatch {
            step: record.key.clone(),
            recorded: record.kind(),
            reached,
        })
    }
}

fn failure_of(record: &StepRecord) -> StepFailure {
    record
        .error
        .clone()
        .unwrap_or_else(|| StepFailure::message("step failed"))
}

fn step_failed(record: &StepRecord) -> WorkflowError {
    WorkflowError::StepFailed {
        step: record.key.clone(),
        failure: failure_of(record),
    }
}

/// The memoized outcome of a settled step.
fn settled<T: DeserializeOwned>(record: &StepRecord) -> Option<Result<T, WorkflowError>> {
    match record.status {
        StepStatus::Pending => None,
        StepStatus::Succeeded => Some(decode(record.result.clone().unwrap_or(Value::Null))),
        StepStatus::Failed => Some(Err(step_failed(record))),
    }
}

/// What to hand the scheduler for a PENDING step.
fn submission_for(record: &StepRecord) -> Option<Submission> {
    let step = record.key.clone();
    let token = record.owner_token.clone();
    match &record.detail {
        StepDetail::Run => Some(Submission::Branch { step, token }),
        StepDetail::Sleep { wake_at } | StepDetail::SleepUntil { wake_at } => Some(Submission::Wake {
            step,
            token,
            wake_at: *wake_at,
        }),
        StepDetail::Call { request } => Some(Submission::Call {
            step,
            token,
            request: request.clone(),
        }),
        StepDetail::WaitForEvent {
            event_id,
            timeout_at,
        } => Some(Submission::Wait {
            step,
            token,
            event_id: event_id.clone(),
            timeout_at: *timeout_at,
        }),
        StepDetail::Notify { .. } => None,
    }
}
