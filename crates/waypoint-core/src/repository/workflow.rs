//! Workflow repository trait definition.
//!
//! Defines the storage interface for runs, the step ledger, waiters and
//! message bookkeeping. Every state change goes through one of these
//! operations, and each of them is atomic: inserts are insert-if-absent,
//! status changes are compare-and-set, and waiter resolution is a
//! test-and-set from PENDING. The infrastructure layer (waypoint-infra)
//! implements this trait with SQLite persistence; `InMemoryWorkflowRepository`
//! implements it for tests and local development.

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    RunId, RunPatch, StepCompletion, StepFailure, StepKey, StepRecord, Waiter,
    WaiterResolution, WorkflowRun, WorkflowRunStatus,
};

/// Repository trait for durable workflow state.
///
/// Covers four entity families:
/// - **Runs:** create (insert-if-absent), compare-and-set transitions, purge.
/// - **Steps:** the ordered ledger of a run, with leases for step bodies.
/// - **Waiters:** pending `wait_for_event` registrations.
/// - **Messages:** outbound message ids per run and processed inbound ids.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run unless one with the same id exists. Returns `true` if inserted.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by status.
    fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Move a run to `to` if its current status is one of `from`.
    ///
    /// Returns `true` if the transition was applied. `completed_at` is set when
    /// `to` is terminal. Patch fields that are `Some` overwrite stored values.
    fn transition_run(
        &self,
        run_id: &RunId,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        patch: RunPatch,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Take the failure-handler lease of a FAILED_PENDING_CALLBACK run.
    ///
    /// Returns `true` if the run is pending its failure callback and no other
    /// holder's lease is live. The lease ends when the run leaves
    /// FAILED_PENDING_CALLBACK or on `release_failure_handler`.
    fn claim_failure_handler(
        &self,
        run_id: &RunId,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn release_failure_handler(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete terminal runs completed before `older_than`, with all their
    /// steps, waiters and messages. Returns the number of runs removed.
    fn purge_runs(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// All step records of a run in insertion order.
    fn load_ledger(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    fn get_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// Insert a step record unless the key exists. Returns `true` if inserted.
    fn insert_step(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Take the execution lease of a PENDING step.
    ///
    /// Succeeds only if `token` is the step's owner token and no other lease
    /// is live. Returns the new attempt number (1-based).
    fn begin_attempt(
        &self,
        run_id: &RunId,
        key: &StepKey,
        token: &str,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<u32>, RepositoryError>> + Send;

    /// PENDING -> SUCCEEDED with `result`.
    fn complete_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        result: &Value,
    ) -> impl std::future::Future<Output = Result<StepCompletion, RepositoryError>> + Send;

    /// PENDING -> FAILED with `failure`.
    fn fail_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
    ) -> impl std::future::Future<Output = Result<StepCompletion, RepositoryError>> + Send;

    /// Record a failed attempt of a PENDING step and hand it to `new_token`.
    ///
    /// Releases the lease. Returns `false` if the step is no longer PENDING.
    fn reschedule_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
        new_token: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Waiters
    // -----------------------------------------------------------------------

    /// Insert a waiter unless one exists for `(run_id, step)`.
    fn create_waiter(
        &self,
        waiter: &Waiter,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
    ) -> impl std::future::Future<Output = Result<Option<Waiter>, RepositoryError>> + Send;

    fn list_waiters(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Vec<Waiter>, RepositoryError>> + Send;

    /// Every PENDING waiter registered for `event_id`, oldest first.
    fn pending_waiters(
        &self,
        event_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Waiter>, RepositoryError>> + Send;

    /// Test-and-set a PENDING waiter to NOTIFIED or TIMED_OUT.
    ///
    /// Returns the resolved waiter if this call won, `None` otherwise.
    fn resolve_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
        resolution: WaiterResolution,
    ) -> impl std::future::Future<Output = Result<Option<Waiter>, RepositoryError>> + Send;

    /// Delete the PENDING waiters of a run. Returns how many were removed.
    fn cancel_waiters(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Remember a message id published on behalf of a run.
    fn record_outbound(
        &self,
        run_id: &RunId,
        message_id: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn outbound_messages(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Mark an inbound message id as fully processed.
    fn mark_processed(
        &self,
        message_id: &str,
        run_id: Option<&RunId>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn is_processed(
        &self,
        message_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
