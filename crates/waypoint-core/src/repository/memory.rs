//! In-memory `WorkflowRepository` used by tests and local development.
//!
//! All maps live behind one mutex so that every operation is atomic with
//! respect to every other, matching the guarantees of the SQLite adapter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    RunId, RunPatch, StepCompletion, StepFailure, StepKey, StepRecord, StepStatus, Waiter,
    WaiterResolution, WaiterStatus, WorkflowRun, WorkflowRunStatus,
};

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, WorkflowRun>,
    /// Ledger per run, in insertion order.
    steps: HashMap<RunId, Vec<StepRecord>>,
    waiters: HashMap<RunId, Vec<Waiter>>,
    outbound: HashMap<RunId, Vec<String>>,
    processed: HashMap<String, Option<RunId>>,
    failure_leases: HashMap<RunId, DateTime<Utc>>,
}

/// Thread-safe in-memory repository. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_step<'a>(
    state: &'a mut MemoryState,
    run_id: &RunId,
    key: &StepKey,
) -> Result<&'a mut StepRecord, RepositoryError> {
    state
        .steps
        .get_mut(run_id)
        .and_then(|steps| steps.iter_mut().find(|s| &s.key == key))
        .ok_or(RepositoryError::NotFound)
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        if state.runs.contains_key(&run.run_id) {
            return Ok(false);
        }
        state.runs.insert(run.run_id.clone(), run.clone());
        Ok(true)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.lock();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn transition_run(
        &self,
        run_id: &RunId,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        patch: RunPatch,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if !from.contains(&run.status) {
            return Ok(false);
        }
        let now = Utc::now();
        run.status = to;
        run.updated_at = now;
        if to.is_terminal() {
            run.completed_at = Some(now);
        }
        if let Some(result) = patch.result {
            run.result = Some(result);
        }
        if let Some(failure) = patch.failure {
            run.failure = Some(failure);
        }
        if let Some(response) = patch.failure_response {
            run.failure_response = Some(response);
        }
        Ok(true)
    }

    async fn claim_failure_handler(
        &self,
        run_id: &RunId,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let run = state.runs.get(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status != WorkflowRunStatus::FailedPendingCallback {
            return Ok(false);
        }
        let now = Utc::now();
        if state.failure_leases.get(run_id).is_some_and(|until| *until > now) {
            return Ok(false);
        }
        state.failure_leases.insert(run_id.clone(), lease_until);
        Ok(true)
    }

    async fn release_failure_handler(&self, run_id: &RunId) -> Result<(), RepositoryError> {
        self.lock().failure_leases.remove(run_id);
        Ok(())
    }

    async fn purge_runs(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.lock();
        let expired: Vec<RunId> = state
            .runs
            .values()
            .filter(|r| r.status.is_terminal())
            .filter(|r| r.completed_at.is_some_and(|at| at < older_than))
            .map(|r| r.run_id.clone())
            .collect();
        for run_id in &expired {
            state.runs.remove(run_id);
            state.steps.remove(run_id);
            state.waiters.remove(run_id);
            state.outbound.remove(run_id);
            state.failure_leases.remove(run_id);
        }
        let purged: HashSet<&RunId> = expired.iter().collect();
        state
            .processed
            .retain(|_, run| run.as_ref().is_none_or(|r| !purged.contains(r)));
        Ok(expired.len() as u64)
    }

    async fn load_ledger(&self, run_id: &RunId) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self.lock().steps.get(run_id).cloned().unwrap_or_default())
    }

    async fn get_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        Ok(self
            .lock()
            .steps
            .get(run_id)
            .and_then(|steps| steps.iter().find(|s| &s.key == key))
            .cloned())
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let steps = state.steps.entry(record.run_id.clone()).or_default();
        if steps.iter().any(|s| s.key == record.key) {
            return Ok(false);
        }
        steps.push(record.clone());
        Ok(true)
    }

    async fn begin_attempt(
        &self,
        run_id: &RunId,
        key: &StepKey,
        token: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<u32>, RepositoryError> {
        let mut state = self.lock();
        let step = find_step(&mut state, run_id, key)?;
        let now = Utc::now();
        if step.status != StepStatus::Pending || step.owner_token != token {
            return Ok(None);
        }
        if step.leased_until.is_some_and(|until| until > now) {
            return Ok(None);
        }
        step.attempts += 1;
        step.leased_until = Some(lease_until);
        Ok(Some(step.attempts))
    }

    async fn complete_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        result: &Value,
    ) -> Result<StepCompletion, RepositoryError> {
        let mut state = self.lock();
        let step = find_step(&mut state, run_id, key)?;
        if step.status != StepStatus::Pending {
            return Ok(StepCompletion::AlreadyTerminal);
        }
        step.status = StepStatus::Succeeded;
        step.result = Some(result.clone());
        step.leased_until = None;
        step.completed_at = Some(Utc::now());
        Ok(StepCompletion::Applied)
    }

    async fn fail_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
    ) -> Result<StepCompletion, RepositoryError> {
        let mut state = self.lock();
        let step = find_step(&mut state, run_id, key)?;
        if step.status != StepStatus::Pending {
            return Ok(StepCompletion::AlreadyTerminal);
        }
        step.status = StepStatus::Failed;
        step.error = Some(failure.clone());
        step.leased_until = None;
        step.completed_at = Some(Utc::now());
        Ok(StepCompletion::Applied)
    }

    async fn reschedule_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
        new_token: &str,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let step = find_step(&mut state, run_id, key)?;
        if step.status != StepStatus::Pending {
            return Ok(false);
        }
        step.error = Some(failure.clone());
        step.owner_token = new_token.to_string();
        step.leased_until = None;
        Ok(true)
    }

    async fn create_waiter(&self, waiter: &Waiter) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        let waiters = state.waiters.entry(waiter.run_id.clone()).or_default();
        if waiters.iter().any(|w| w.step == waiter.step) {
            return Ok(false);
        }
        waiters.push(waiter.clone());
        Ok(true)
    }

    async fn get_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
    ) -> Result<Option<Waiter>, RepositoryError> {
        Ok(self
            .lock()
            .waiters
            .get(run_id)
            .and_then(|ws| ws.iter().find(|w| &w.step == step))
            .cloned())
    }

    async fn list_waiters(&self, run_id: &RunId) -> Result<Vec<Waiter>, RepositoryError> {
        Ok(self.lock().waiters.get(run_id).cloned().unwrap_or_default())
    }

    async fn pending_waiters(&self, event_id: &str) -> Result<Vec<Waiter>, RepositoryError> {
        let state = self.lock();
        let mut pending: Vec<Waiter> = state
            .waiters
            .values()
            .flatten()
            .filter(|w| w.event_id == event_id && w.status == WaiterStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn resolve_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
        resolution: WaiterResolution,
    ) -> Result<Option<Waiter>, RepositoryError> {
        let mut state = self.lock();
        let Some(waiter) = state
            .waiters
            .get_mut(run_id)
            .and_then(|ws| ws.iter_mut().find(|w| &w.step == step))
        else {
            return Ok(None);
        };
        if waiter.status != WaiterStatus::Pending {
            return Ok(None);
        }
        match resolution {
            WaiterResolution::Notified(data) => {
                waiter.status = WaiterStatus::Notified;
                waiter.event_data = Some(data);
            }
            WaiterResolution::TimedOut => waiter.status = WaiterStatus::TimedOut,
        }
        waiter.resolved_at = Some(Utc::now());
        Ok(Some(waiter.clone()))
    }

    async fn cancel_waiters(&self, run_id: &RunId) -> Result<u64, RepositoryError> {
        let mut state = self.lock();
        let Some(waiters) = state.waiters.get_mut(run_id) else {
            return Ok(0);
        };
        let before = waiters.len();
        waiters.retain(|w| w.status != WaiterStatus::Pending);
        Ok((before - waiters.len()) as u64)
    }

    async fn record_outbound(&self, run_id: &RunId, message_id: &str) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let ids = state.outbound.entry(run_id.clone()).or_default();
        if !ids.iter().any(|id| id == message_id) {
            ids.push(message_id.to_string());
        }
        Ok(())
    }

    async fn outbound_messages(&self, run_id: &RunId) -> Result<Vec<String>, RepositoryError> {
        Ok(self.lock().outbound.get(run_id).cloned().unwrap_or_default())
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        run_id: Option<&RunId>,
    ) -> Result<(), RepositoryError> {
        self.lock()
            .processed
            .insert(message_id.to_string(), run_id.cloned());
        Ok(())
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.lock().processed.contains_key(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_types::workflow::StepDetail;

    fn run(id: &str) -> WorkflowRun {
        WorkflowRun::new(
            RunId(id.to_string()),
            "order",
            "http://localhost/workflows/order",
            br#"{"userId":"u1"}"#.to_vec(),
        )
    }

    fn step(run_id: &str, name: &str, token: &str) -> StepRecord {
        StepRecord::pending(
            RunId(run_id.to_string()),
            StepKey::new(name, 0),
            StepDetail::Run,
            token.to_string(),
        )
    }

    #[tokio::test]
    async fn test_failure_handler_lease_expires() {
        let repo = InMemoryWorkflowRepository::new();
        repo.create_run(&run("wfr_1")).await.unwrap();
        let id = RunId("wfr_1".to_string());
        repo.transition_run(
            &id,
            &WorkflowRunStatus::LIVE,
            WorkflowRunStatus::FailedPendingCallback,
            RunPatch::none(),
        )
        .await
        .unwrap();

        let expired = Utc::now() - chrono::Duration::seconds(1);
        assert!(repo.claim_failure_handler(&id, expired).await.unwrap());
        let live = Utc::now() + chrono::Duration::minutes(5);
        assert!(repo.claim_failure_handler(&id, live).await.unwrap());
        assert!(!repo.claim_failure_handler(&id, live).await.unwrap());

        repo.transition_run(
            &id,
            &[WorkflowRunStatus::FailedPendingCallback],
            WorkflowRunStatus::Failed,
            RunPatch::none(),
        )
        .await
        .unwrap();
        repo.release_failure_handler(&id).await.unwrap();
        assert!(!repo.claim_failure_handler(&id, live).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_run_is_insert_if_absent() {
        let repo = InMemoryWorkflowRepository::new();
        assert!(repo.create_run(&run("wfr_1")).await.unwrap());
        assert!(!repo.create_run(&run("wfr_1")).await.unwrap());
        let loaded = repo.get_run(&RunId("wfr_1".to_string())).await.unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"userId": "u1"}));
    }

    #[tokio::test]
    async fn test_transition_run_compare_and_set() {
        let repo = InMemoryWorkflowRepository::new();
        repo.create_run(&run("wfr_1")).await.unwrap();
        let id = RunId("wfr_1".to_string());

        assert!(
            !repo
                .transition_run(&id, &[WorkflowRunStatus::Waiting], WorkflowRunStatus::Running, RunPatch::none())
                .await
                .unwrap()
        );
        assert!(
            repo.transition_run(
                &id,
                &WorkflowRunStatus::LIVE,
                WorkflowRunStatus::Succeeded,
                RunPatch::result(json!("ok"))
            )
            .await
            .unwrap()
        );
        let loaded = repo.get_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Succeeded);
        assert_eq!(loaded.result, Some(json!("ok")));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_insert_step_race_has_one_winner() {
        let repo = InMemoryWorkflowRepository::new();
        assert!(repo.insert_step(&step("wfr_1", "a", "t1")).await.unwrap());
        assert!(!repo.insert_step(&step("wfr_1", "a", "t2")).await.unwrap());
        let stored = repo
            .get_step(&RunId("wfr_1".to_string()), &StepKey::new("a", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.owner_token, "t1");
    }

    #[tokio::test]
    async fn test_begin_attempt_requires_owner_and_free_lease() {
        let repo = InMemoryWorkflowRepository::new();
        repo.insert_step(&step("wfr_1", "a", "owner")).await.unwrap();
        let id = RunId("wfr_1".to_string());
        let key = StepKey::new("a", 0);
        let lease = Utc::now() + chrono::Duration::seconds(60);

        assert_eq!(repo.begin_attempt(&id, &key, "intruder", lease).await.unwrap(), None);
        assert_eq!(repo.begin_attempt(&id, &key, "owner", lease).await.unwrap(), Some(1));
        // Lease is still live.
        assert_eq!(repo.begin_attempt(&id, &key, "owner", lease).await.unwrap(), None);

        assert!(
            repo.reschedule_step(&id, &key, &StepFailure::message("boom"), "next")
                .await
                .unwrap()
        );
        assert_eq!(repo.begin_attempt(&id, &key, "next", lease).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_complete_step_is_idempotent() {
        let repo = InMemoryWorkflowRepository::new();
        repo.insert_step(&step("wfr_1", "a", "t")).await.unwrap();
        let id = RunId("wfr_1".to_string());
        let key = StepKey::new("a", 0);

        assert_eq!(
            repo.complete_step(&id, &key, &json!("first")).await.unwrap(),
            StepCompletion::Applied
        );
        assert_eq!(
            repo.complete_step(&id, &key, &json!("second")).await.unwrap(),
            StepCompletion::AlreadyTerminal
        );
        assert_eq!(
            repo.fail_step(&id, &key, &StepFailure::message("late")).await.unwrap(),
            StepCompletion::AlreadyTerminal
        );
        let stored = repo.get_step(&id, &key).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!("first")));
        assert_eq!(stored.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_complete_unknown_step_is_not_found() {
        let repo = InMemoryWorkflowRepository::new();
        let err = repo
            .complete_step(&RunId("wfr_x".to_string()), &StepKey::new("a", 0), &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_resolve_waiter_test_and_set() {
        let repo = InMemoryWorkflowRepository::new();
        let id = RunId("wfr_1".to_string());
        let key = StepKey::new("approval", 0);
        let waiter = Waiter::pending(id.clone(), key.clone(), "evt", Utc::now(), "tok".to_string());
        assert!(repo.create_waiter(&waiter).await.unwrap());
        assert!(!repo.create_waiter(&waiter).await.unwrap());
        assert_eq!(repo.pending_waiters("evt").await.unwrap().len(), 1);

        let won = repo
            .resolve_waiter(&id, &key, WaiterResolution::Notified(json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(won.unwrap().status, WaiterStatus::Notified);
        let lost = repo
            .resolve_waiter(&id, &key, WaiterResolution::TimedOut)
            .await
            .unwrap();
        assert!(lost.is_none());
        assert!(repo.pending_waiters("evt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_terminal_runs() {
        let repo = InMemoryWorkflowRepository::new();
        repo.create_run(&run("wfr_done")).await.unwrap();
        repo.create_run(&run("wfr_live")).await.unwrap();
        let done = RunId("wfr_done".to_string());
        repo.transition_run(&done, &WorkflowRunStatus::LIVE, WorkflowRunStatus::Succeeded, RunPatch::none())
            .await
            .unwrap();
        repo.insert_step(&step("wfr_done", "a", "t")).await.unwrap();
        repo.mark_processed("msg_1", Some(&done)).await.unwrap();

        let purged = repo
            .purge_runs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get_run(&done).await.unwrap().is_none());
        assert!(repo.load_ledger(&done).await.unwrap().is_empty());
        assert!(!repo.is_processed("msg_1").await.unwrap());
        assert!(repo.get_run(&RunId("wfr_live".to_string())).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outbound_messages_deduplicated() {
        let repo = InMemoryWorkflowRepository::new();
        let id = RunId("wfr_1".to_string());
        repo.record_outbound(&id, "m1").await.unwrap();
        repo.record_outbound(&id, "m1").await.unwrap();
        repo.record_outbound(&id, "m2").await.unwrap();
        assert_eq!(repo.outbound_messages(&id).await.unwrap(), vec!["m1", "m2"]);
    }
}
