//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `waypoint-core` using sqlx with split
//! read/write pools. Every state change is a single conditional statement on
//! the single-connection writer, so compare-and-set operations (run
//! transitions, step leases, waiter resolution) are atomic. Kind details,
//! results and failures are stored as JSON text.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use waypoint_core::repository::workflow::WorkflowRepository;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    RunId, RunPatch, StepCompletion, StepFailure, StepKey, StepRecord, StepStatus, Waiter,
    WaiterResolution, WaiterStatus, WorkflowRun, WorkflowRunStatus, parse_payload,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn run_exists(&self, run_id: &RunId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(row.is_some())
    }

    async fn step_exists(&self, run_id: &RunId, key: &StepKey) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT 1 FROM workflow_steps WHERE run_id = ? AND step_name = ? AND occurrence = ?",
        )
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(row.is_some())
    }

    /// Map "no row changed" to `NotFound` when the step does not exist.
    async fn unchanged_step<T>(
        &self,
        run_id: &RunId,
        key: &StepKey,
        unchanged: T,
    ) -> Result<T, RepositoryError> {
        if self.step_exists(run_id, key).await? {
            Ok(unchanged)
        } else {
            Err(RepositoryError::NotFound)
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRunRow {
    run_id: String,
    workflow_name: String,
    workflow_url: String,
    status: String,
    raw_payload: Vec<u8>,
    result: Option<String>,
    failure: Option<String>,
    failure_response: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl WorkflowRunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_url: row.try_get("workflow_url")?,
            status: row.try_get("status")?,
            raw_payload: row.try_get("raw_payload")?,
            result: row.try_get("result")?,
            failure: row.try_get("failure")?,
            failure_response: row.try_get("failure_response")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: WorkflowRunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let payload = parse_payload(&self.raw_payload);
        Ok(WorkflowRun {
            run_id: RunId(self.run_id),
            workflow_name: self.workflow_name,
            workflow_url: self.workflow_url,
            status,
            payload,
            raw_payload: self.raw_payload,
            result: parse_json_opt(self.result.as_deref(), "run result")?,
            failure: parse_json_opt(self.failure.as_deref(), "run failure")?,
            failure_response: parse_json_opt(self.failure_response.as_deref(), "failure response")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct WorkflowStepRow {
    run_id: String,
    step_name: String,
    occurrence: i64,
    detail: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    owner_token: String,
    leased_until: Option<String>,
    batch: Option<String>,
    scheduled_at: String,
    completed_at: Option<String>,
}

impl WorkflowStepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            occurrence: row.try_get("occurrence")?,
            detail: row.try_get("detail")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            owner_token: row.try_get("owner_token")?,
            leased_until: row.try_get("leased_until")?,
            batch: row.try_get("batch")?,
            scheduled_at: row.try_get("scheduled_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(StepRecord {
            run_id: RunId(self.run_id),
            key: StepKey::new(self.step_name, to_u32(self.occurrence)?),
            detail: parse_json(&self.detail, "step detail")?,
            status,
            result: parse_json_opt(self.result.as_deref(), "step result")?,
            error: parse_json_opt(self.error.as_deref(), "step error")?,
            attempts: to_u32(self.attempts)?,
            owner_token: self.owner_token,
            leased_until: self.leased_until.as_deref().map(parse_datetime).transpose()?,
            batch: parse_json_opt(self.batch.as_deref(), "batch membership")?,
            scheduled_at: parse_datetime(&self.scheduled_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct WaiterRow {
    run_id: String,
    step_name: String,
    occurrence: i64,
    event_id: String,
    timeout_at: String,
    status: String,
    event_data: Option<String>,
    token: String,
    created_at: String,
    resolved_at: Option<String>,
}

impl WaiterRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            occurrence: row.try_get("occurrence")?,
            event_id: row.try_get("event_id")?,
            timeout_at: row.try_get("timeout_at")?,
            status: row.try_get("status")?,
            event_data: row.try_get("event_data")?,
            token: row.try_get("token")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn into_waiter(self) -> Result<Waiter, RepositoryError> {
        let status: WaiterStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(Waiter {
            run_id: RunId(self.run_id),
            step: StepKey::new(self.step_name, to_u32(self.occurrence)?),
            event_id: self.event_id,
            timeout_at: parse_datetime(&self.timeout_at)?,
            status,
            event_data: parse_json_opt(self.event_data.as_deref(), "event data")?,
            token: self.token,
            created_at: parse_datetime(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn parse_json_opt<T: DeserializeOwned>(s: Option<&str>, what: &str) -> Result<Option<T>, RepositoryError> {
    s.map(|s| parse_json(s, what)).transpose()
}

fn to_u32(value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("integer out of range: {value}")))
}

fn collect<T>(
    rows: &[SqliteRow],
    convert: impl Fn(&SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(convert).collect()
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    WorkflowRunRow::from_row(row).map_err(query_err)?.into_run()
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord, RepositoryError> {
    WorkflowStepRow::from_row(row).map_err(query_err)?.into_record()
}

fn waiter_from_row(row: &SqliteRow) -> Result<Waiter, RepositoryError> {
    WaiterRow::from_row(row).map_err(query_err)?.into_waiter()
}

const TERMINAL_STATUSES: &str = "('SUCCEEDED', 'FAILED', 'CANCELED')";

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_name, workflow_url, status, raw_payload, result, failure,
                failure_response, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO NOTHING"#,
        )
        .bind(run.run_id.as_str())
        .bind(&run.workflow_name)
        .bind(&run.workflow_url)
        .bind(run.status.as_str())
        .bind(&run.raw_payload)
        .bind(run.result.as_ref().map(to_json).transpose()?)
        .bind(run.failure.as_ref().map(to_json).transpose()?)
        .bind(run.failure_response.as_ref().map(to_json).transpose()?)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        status: Option<WorkflowRunStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE status = ? ORDER BY created_at DESC, run_id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs ORDER BY created_at DESC, run_id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        collect(&rows, run_from_row)
    }

    async fn transition_run(
        &self,
        run_id: &RunId,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        patch: RunPatch,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = Utc::now();
        let completed_at = to.is_terminal().then(|| format_datetime(&now));
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE workflow_runs SET status = ?, updated_at = ?, \
             completed_at = COALESCE(?, completed_at), \
             result = COALESCE(?, result), \
             failure = COALESCE(?, failure), \
             failure_response = COALESCE(?, failure_response) \
             WHERE run_id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(format_datetime(&now))
            .bind(completed_at)
            .bind(patch.result.as_ref().map(to_json).transpose()?)
            .bind(patch.failure.as_ref().map(to_json).transpose()?)
            .bind(patch.failure_response.as_ref().map(to_json).transpose()?)
            .bind(run_id.as_str());
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool.writer).await.map_err(query_err)?;

        if result.rows_affected() == 0 {
            if !self.run_exists(run_id).await? {
                return Err(RepositoryError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn claim_failure_handler(
        &self,
        run_id: &RunId,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET failure_lease_until = ?
               WHERE run_id = ? AND status = 'FAILED_PENDING_CALLBACK'
                 AND (failure_lease_until IS NULL OR failure_lease_until <= ?)"#,
        )
        .bind(format_datetime(&lease_until))
        .bind(run_id.as_str())
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            if !self.run_exists(run_id).await? {
                return Err(RepositoryError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn release_failure_handler(&self, run_id: &RunId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE workflow_runs SET failure_lease_until = NULL WHERE run_id = ?")
            .bind(run_id.as_str())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn purge_runs(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let cutoff = format_datetime(&older_than);
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // Steps and waiters go with their run (ON DELETE CASCADE); message ids
        // carry no foreign key because processed ids may predate their run.
        sqlx::query(&format!(
            "DELETE FROM workflow_messages WHERE run_id IN \
             (SELECT run_id FROM workflow_runs WHERE status IN {TERMINAL_STATUSES} \
              AND completed_at IS NOT NULL AND completed_at < ?)"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let result = sqlx::query(&format!(
            "DELETE FROM workflow_runs WHERE status IN {TERMINAL_STATUSES} \
             AND completed_at IS NOT NULL AND completed_at < ?"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn load_ledger(&self, run_id: &RunId) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        collect(&rows, step_from_row)
    }

    async fn get_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        // Read through the writer: callers re-read right after a lost CAS.
        let row = sqlx::query(
            "SELECT * FROM workflow_steps WHERE run_id = ? AND step_name = ? AND occurrence = ?",
        )
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_steps
               (run_id, step_name, occurrence, detail, status, result, error, attempts,
                owner_token, leased_until, batch, scheduled_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_name, occurrence) DO NOTHING"#,
        )
        .bind(record.run_id.as_str())
        .bind(&record.key.name)
        .bind(i64::from(record.key.occurrence))
        .bind(to_json(&record.detail)?)
        .bind(record.status.as_str())
        .bind(record.result.as_ref().map(to_json).transpose()?)
        .bind(record.error.as_ref().map(to_json).transpose()?)
        .bind(i64::from(record.attempts))
        .bind(&record.owner_token)
        .bind(record.leased_until.as_ref().map(format_datetime))
        .bind(record.batch.as_ref().map(to_json).transpose()?)
        .bind(format_datetime(&record.scheduled_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin_attempt(
        &self,
        run_id: &RunId,
        key: &StepKey,
        token: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<u32>, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE workflow_steps SET attempts = attempts + 1, leased_until = ?
               WHERE run_id = ? AND step_name = ? AND occurrence = ?
                 AND status = 'PENDING' AND owner_token = ?
                 AND (leased_until IS NULL OR leased_until <= ?)
               RETURNING attempts"#,
        )
        .bind(format_datetime(&lease_until))
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .bind(token)
        .bind(format_datetime(&Utc::now()))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let attempts: i64 = row.try_get("attempts").map_err(query_err)?;
                Ok(Some(to_u32(attempts)?))
            }
            None => self.unchanged_step(run_id, key, None).await,
        }
    }

    async fn complete_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        result: &Value,
    ) -> Result<StepCompletion, RepositoryError> {
        let updated = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'SUCCEEDED', result = ?, leased_until = NULL, completed_at = ?
               WHERE run_id = ? AND step_name = ? AND occurrence = ? AND status = 'PENDING'"#,
        )
        .bind(to_json(result)?)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return self.unchanged_step(run_id, key, StepCompletion::AlreadyTerminal).await;
        }
        Ok(StepCompletion::Applied)
    }

    async fn fail_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
    ) -> Result<StepCompletion, RepositoryError> {
        let updated = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'FAILED', error = ?, leased_until = NULL, completed_at = ?
               WHERE run_id = ? AND step_name = ? AND occurrence = ? AND status = 'PENDING'"#,
        )
        .bind(to_json(failure)?)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return self.unchanged_step(run_id, key, StepCompletion::AlreadyTerminal).await;
        }
        Ok(StepCompletion::Applied)
    }

    async fn reschedule_step(
        &self,
        run_id: &RunId,
        key: &StepKey,
        failure: &StepFailure,
        new_token: &str,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            r#"UPDATE workflow_steps SET error = ?, owner_token = ?, leased_until = NULL
               WHERE run_id = ? AND step_name = ? AND occurrence = ? AND status = 'PENDING'"#,
        )
        .bind(to_json(failure)?)
        .bind(new_token)
        .bind(run_id.as_str())
        .bind(&key.name)
        .bind(i64::from(key.occurrence))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            return self.unchanged_step(run_id, key, false).await;
        }
        Ok(true)
    }

    async fn create_waiter(&self, waiter: &Waiter) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_waiters
               (run_id, step_name, occurrence, event_id, timeout_at, status, event_data,
                token, created_at, resolved_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_name, occurrence) DO NOTHING"#,
        )
        .bind(waiter.run_id.as_str())
        .bind(&waiter.step.name)
        .bind(i64::from(waiter.step.occurrence))
        .bind(&waiter.event_id)
        .bind(format_datetime(&waiter.timeout_at))
        .bind(waiter.status.as_str())
        .bind(waiter.event_data.as_ref().map(to_json).transpose()?)
        .bind(&waiter.token)
        .bind(format_datetime(&waiter.created_at))
        .bind(waiter.resolved_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
    ) -> Result<Option<Waiter>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_waiters WHERE run_id = ? AND step_name = ? AND occurrence = ?",
        )
        .bind(run_id.as_str())
        .bind(&step.name)
        .bind(i64::from(step.occurrence))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(waiter_from_row).transpose()
    }

    async fn list_waiters(&self, run_id: &RunId) -> Result<Vec<Waiter>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_waiters WHERE run_id = ? ORDER BY created_at ASC, rowid ASC")
            .bind(run_id.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        collect(&rows, waiter_from_row)
    }

    async fn pending_waiters(&self, event_id: &str) -> Result<Vec<Waiter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_waiters WHERE event_id = ? AND status = 'PENDING' ORDER BY created_at ASC, rowid ASC",
        )
        .bind(event_id)
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_err)?;

        collect(&rows, waiter_from_row)
    }

    async fn resolve_waiter(
        &self,
        run_id: &RunId,
        step: &StepKey,
        resolution: WaiterResolution,
    ) -> Result<Option<Waiter>, RepositoryError> {
        let (status, event_data) = match &resolution {
            WaiterResolution::Notified(data) => (WaiterStatus::Notified, Some(to_json(data)?)),
            WaiterResolution::TimedOut => (WaiterStatus::TimedOut, None),
        };
        let row = sqlx::query(
            r#"UPDATE workflow_waiters SET status = ?, event_data = ?, resolved_at = ?
               WHERE run_id = ? AND step_name = ? AND occurrence = ? AND status = 'PENDING'
               RETURNING *"#,
        )
        .bind(status.as_str())
        .bind(event_data)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.as_str())
        .bind(&step.name)
        .bind(i64::from(step.occurrence))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        row.as_ref().map(waiter_from_row).transpose()
    }

    async fn cancel_waiters(&self, run_id: &RunId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_waiters WHERE run_id = ? AND status = 'PENDING'")
            .bind(run_id.as_str())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    async fn record_outbound(&self, run_id: &RunId, message_id: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_messages (direction, message_id, run_id, created_at)
               VALUES ('outbound', ?, ?, ?)
               ON CONFLICT(direction, message_id) DO NOTHING"#,
        )
        .bind(message_id)
        .bind(run_id.as_str())
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn outbound_messages(&self, run_id: &RunId) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT message_id FROM workflow_messages WHERE direction = 'outbound' AND run_id = ? ORDER BY rowid ASC",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        run_id: Option<&RunId>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_messages (direction, message_id, run_id, created_at)
               VALUES ('processed', ?, ?, ?)
               ON CONFLICT(direction, message_id) DO UPDATE SET run_id = excluded.run_id"#,
        )
        .bind(message_id)
        .bind(run_id.map(RunId::as_str))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_messages WHERE direction = 'processed' AND message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(row.is_some())
    }
}
