//! Workflow domain types for Waypoint.
//!
//! A `WorkflowRun` is one end-to-end execution of a registered workflow
//! function. Its progress lives entirely in the step ledger: an ordered list
//! of `StepRecord`s keyed by `(step name, occurrence)`. Waiters track pending
//! `wait_for_event` registrations, and `FailureContext` is handed to the
//! failure handler once a run cannot make further progress.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Header map shape used by call responses and failure payloads.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Run identity
// ---------------------------------------------------------------------------

/// Opaque identifier of a workflow run (`wfr_<uuid-v7>` when generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Prefix applied to generated run ids.
    pub const PREFIX: &'static str = "wfr_";

    /// Generate a fresh, time-sortable run id.
    pub fn new() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("run id must not be empty".to_string());
        }
        if trimmed.len() > 128 || trimmed.chars().any(|c| c.is_control()) {
            return Err(format!("invalid run id: '{trimmed}'"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow run.
///
/// `Running`/`Waiting` are live, `FailedPendingCallback` is waiting on the
/// failure handler, and `Succeeded`/`Failed`/`Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    Running,
    Waiting,
    Succeeded,
    FailedPendingCallback,
    Failed,
    Canceled,
}

impl WorkflowRunStatus {
    pub const LIVE: [WorkflowRunStatus; 2] = [WorkflowRunStatus::Running, WorkflowRunStatus::Waiting];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "RUNNING",
            WorkflowRunStatus::Waiting => "WAITING",
            WorkflowRunStatus::Succeeded => "SUCCEEDED",
            WorkflowRunStatus::FailedPendingCallback => "FAILED_PENDING_CALLBACK",
            WorkflowRunStatus::Failed => "FAILED",
            WorkflowRunStatus::Canceled => "CANCELED",
        }
    }

    /// Terminal runs never change status again and are eligible for purge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Succeeded | WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled
        )
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(WorkflowRunStatus::Running),
            "WAITING" => Ok(WorkflowRunStatus::Waiting),
            "SUCCEEDED" => Ok(WorkflowRunStatus::Succeeded),
            "FAILED_PENDING_CALLBACK" => Ok(WorkflowRunStatus::FailedPendingCallback),
            "FAILED" => Ok(WorkflowRunStatus::Failed),
            "CANCELED" => Ok(WorkflowRunStatus::Canceled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// A single execution of a workflow function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: RunId,
    /// Name the workflow was registered under.
    pub workflow_name: String,
    /// Self-referencing URL used for every continuation of this run.
    pub workflow_url: String,
    pub status: WorkflowRunStatus,
    /// Trigger payload exactly as received.
    #[serde(with = "crate::encoding::base64_bytes")]
    pub raw_payload: Vec<u8>,
    /// Trigger payload parsed as JSON (a JSON string if it was not JSON).
    pub payload: Value,
    /// Return value of the workflow function once SUCCEEDED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Why the run failed (set on entering FAILED_PENDING_CALLBACK).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureContext>,
    /// Outcome reported by the failure function or failure URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_response: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Build a new RUNNING run from a raw trigger payload.
    pub fn new(
        run_id: RunId,
        workflow_name: impl Into<String>,
        workflow_url: impl Into<String>,
        raw_payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        let payload = parse_payload(&raw_payload);
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            workflow_url: workflow_url.into(),
            status: WorkflowRunStatus::Running,
            raw_payload,
            payload,
            result: None,
            failure: None,
            failure_response: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Parse a raw trigger payload: JSON when possible, otherwise a JSON string
/// holding the lossy UTF-8 text. An empty body becomes `null`.
pub fn parse_payload(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Fields written together with a run status transition.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub result: Option<Value>,
    pub failure: Option<FailureContext>,
    pub failure_response: Option<Value>,
}

impl RunPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn result(value: Value) -> Self {
        Self {
            result: Some(value),
            ..Self::default()
        }
    }

    pub fn failure(failure: FailureContext) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn failure_response(value: Value) -> Self {
        Self {
            failure_response: Some(value),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Identity of a step within a run.
///
/// `occurrence` counts how many times the same name was reached earlier in
/// the same replay, so loops reusing a name stay distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub name: String,
    pub occurrence: u32,
}

impl StepKey {
    pub fn new(name: impl Into<String>, occurrence: u32) -> Self {
        Self {
            name: name.into(),
            occurrence,
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.occurrence)
    }
}

/// The kind of a step, without its kind-specific detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Run,
    Sleep,
    SleepUntil,
    Call,
    WaitForEvent,
    Notify,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Run => "RUN",
            StepKind::Sleep => "SLEEP",
            StepKind::SleepUntil => "SLEEP_UNTIL",
            StepKind::Call => "CALL",
            StepKind::WaitForEvent => "WAIT_FOR_EVENT",
            StepKind::Notify => "NOTIFY",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific parameters of a step, fixed when the step is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepDetail {
    Run,
    Sleep {
        #[serde(rename = "wakeAt")]
        wake_at: DateTime<Utc>,
    },
    SleepUntil {
        #[serde(rename = "wakeAt")]
        wake_at: DateTime<Utc>,
    },
    Call {
        request: CallRequest,
    },
    WaitForEvent {
        #[serde(rename = "eventId")]
        event_id: String,
        #[serde(rename = "timeoutAt")]
        timeout_at: DateTime<Utc>,
    },
    Notify {
        #[serde(rename = "eventId")]
        event_id: String,
    },
}

impl StepDetail {
    pub fn kind(&self) -> StepKind {
        match self {
            StepDetail::Run => StepKind::Run,
            StepDetail::Sleep { .. } => StepKind::Sleep,
            StepDetail::SleepUntil { .. } => StepKind::SleepUntil,
            StepDetail::Call { .. } => StepKind::Call,
            StepDetail::WaitForEvent { .. } => StepKind::WaitForEvent,
            StepDetail::Notify { .. } => StepKind::Notify,
        }
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(StepStatus::Pending),
            "SUCCEEDED" => Ok(StepStatus::Succeeded),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Error recorded on a failed step attempt.
///
/// `status`/`header`/`body` are present for CALL steps whose target answered
/// with a non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: HeaderValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl StepFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            header: HeaderValues::new(),
            body: None,
        }
    }

    /// Failure built from a non-2xx third-party response.
    pub fn from_response(response: &CallResponse) -> Self {
        Self {
            message: format!("call returned status {}", response.status),
            status: Some(response.status),
            header: response.header.clone(),
            body: Some(response.body.clone()),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Position of a step inside a parallel batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMembership {
    /// Key of the batch itself (batch name + occurrence).
    pub batch: StepKey,
    pub index: u32,
    pub size: u32,
}

/// One entry of a run's step ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub run_id: RunId,
    pub key: StepKey,
    pub detail: StepDetail,
    pub status: StepStatus,
    /// Memoized result. Present iff SUCCEEDED and never changed afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last attempt error; terminal iff the step is FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Number of times the step body has been started.
    pub attempts: u32,
    /// Delivery token currently allowed to drive this step.
    pub owner_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchMembership>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A fresh PENDING record owned by `owner_token`.
    pub fn pending(run_id: RunId, key: StepKey, detail: StepDetail, owner_token: String) -> Self {
        Self {
            run_id,
            key,
            detail,
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            owner_token,
            leased_until: None,
            batch: None,
            scheduled_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_batch(mut self, batch: BatchMembership) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn kind(&self) -> StepKind {
        self.detail.kind()
    }
}

/// Outcome of writing a terminal result onto a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCompletion {
    /// The step moved from PENDING to the requested terminal status.
    Applied,
    /// The step was already terminal; nothing changed.
    AlreadyTerminal,
}

// ---------------------------------------------------------------------------
// CALL steps
// ---------------------------------------------------------------------------

fn default_method() -> String {
    "POST".to_string()
}

/// A third-party HTTP request proxied through the durable scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Delivery retries for the outbound request (default 0).
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CallRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            retries: 0,
            timeout_secs: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON request body.
    pub fn json(mut self, value: &Value) -> Self {
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        self.body = Some(value.to_string());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Response of a CALL step, memoized as the step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: u16,
    #[serde(default)]
    pub header: HeaderValues,
    #[serde(default)]
    pub body: String,
}

impl CallResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ---------------------------------------------------------------------------
// Waiters
// ---------------------------------------------------------------------------

/// Resolution state of a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaiterStatus {
    Pending,
    Notified,
    TimedOut,
}

impl WaiterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaiterStatus::Pending => "PENDING",
            WaiterStatus::Notified => "NOTIFIED",
            WaiterStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for WaiterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaiterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(WaiterStatus::Pending),
            "NOTIFIED" => Ok(WaiterStatus::Notified),
            "TIMED_OUT" => Ok(WaiterStatus::TimedOut),
            other => Err(format!("invalid waiter status: '{other}'")),
        }
    }
}

/// A pending `wait_for_event` registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waiter {
    pub run_id: RunId,
    /// The WAIT_FOR_EVENT step this waiter resumes.
    pub step: StepKey,
    pub event_id: String,
    pub timeout_at: DateTime<Utc>,
    pub status: WaiterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
    /// Delivery token the resuming message must carry.
    pub token: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Waiter {
    pub fn pending(
        run_id: RunId,
        step: StepKey,
        event_id: impl Into<String>,
        timeout_at: DateTime<Utc>,
        token: String,
    ) -> Self {
        Self {
            run_id,
            step,
            event_id: event_id.into(),
            timeout_at,
            status: WaiterStatus::Pending,
            event_data: None,
            token,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// The step result this waiter resolves to, if it is resolved.
    pub fn outcome(&self) -> Option<WaitEventResult> {
        match self.status {
            WaiterStatus::Pending => None,
            WaiterStatus::Notified => Some(WaitEventResult {
                event_data: self.event_data.clone(),
                timeout: false,
            }),
            WaiterStatus::TimedOut => Some(WaitEventResult {
                event_data: None,
                timeout: true,
            }),
        }
    }
}

/// Terminal state requested for a waiter (test-and-set from PENDING).
#[derive(Debug, Clone, PartialEq)]
pub enum WaiterResolution {
    Notified(Value),
    TimedOut,
}

/// Result of a WAIT_FOR_EVENT step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitEventResult {
    #[serde(default)]
    pub event_data: Option<Value>,
    pub timeout: bool,
}

/// One matched waiter reported back to a notify caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResult {
    pub waiter: Waiter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Failure context
// ---------------------------------------------------------------------------

/// Payload handed to the failure function or POSTed to the failure URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub run_id: RunId,
    pub workflow_url: String,
    /// HTTP-like status: the failing call's status, or 500 for step errors.
    pub status: u16,
    #[serde(default)]
    pub header: HeaderValues,
    /// Raw response body or error message.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepKey>,
}

impl FailureContext {
    pub fn from_step(
        run_id: RunId,
        workflow_url: impl Into<String>,
        step: Option<StepKey>,
        failure: &StepFailure,
    ) -> Self {
        Self {
            run_id,
            workflow_url: workflow_url.into(),
            status: failure.status.unwrap_or(500),
            header: failure.header.clone(),
            body: failure
                .body
                .clone()
                .unwrap_or_else(|| failure.message.clone()),
            failed_step: step,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_id_generated_with_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("wfr_"));
        assert_ne!(id, RunId::new());
    }

    #[test]
    fn test_run_id_from_str_rejects_empty() {
        assert!("".parse::<RunId>().is_err());
        assert!("   ".parse::<RunId>().is_err());
        assert_eq!("custom-run".parse::<RunId>().unwrap().as_str(), "custom-run");
    }

    #[test]
    fn test_run_status_roundtrip_strings() {
        for status in [
            WorkflowRunStatus::Running,
            WorkflowRunStatus::Waiting,
            WorkflowRunStatus::Succeeded,
            WorkflowRunStatus::FailedPendingCallback,
            WorkflowRunStatus::Failed,
            WorkflowRunStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowRunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<WorkflowRunStatus>().is_err());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(WorkflowRunStatus::Succeeded.is_terminal());
        assert!(WorkflowRunStatus::Canceled.is_terminal());
        assert!(WorkflowRunStatus::Failed.is_terminal());
        assert!(!WorkflowRunStatus::FailedPendingCallback.is_terminal());
        assert!(WorkflowRunStatus::Waiting.is_live());
    }

    #[test]
    fn test_parse_payload_json_and_text() {
        assert_eq!(parse_payload(br#"{"userId":"u1"}"#), json!({"userId": "u1"}));
        assert_eq!(parse_payload(b"plain text"), json!("plain text"));
        assert_eq!(parse_payload(b""), Value::Null);
    }

    #[test]
    fn test_step_detail_tagged_serialization() {
        let detail = StepDetail::WaitForEvent {
            event_id: "order-42".to_string(),
            timeout_at: Utc::now(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["kind"], "WAIT_FOR_EVENT");
        assert_eq!(value["eventId"], "order-42");
        assert_eq!(detail.kind(), StepKind::WaitForEvent);

        let run = serde_json::to_value(StepDetail::Run).unwrap();
        assert_eq!(run, json!({"kind": "RUN"}));
    }

    #[test]
    fn test_step_key_display() {
        assert_eq!(StepKey::new("charge", 2).to_string(), "charge#2");
    }

    #[test]
    fn test_call_request_defaults() {
        let request: CallRequest =
            serde_json::from_value(json!({"url": "https://api.example.com"})).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.retries, 0);
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_call_response_success_range() {
        let mut response = CallResponse {
            status: 204,
            header: HeaderValues::new(),
            body: String::new(),
        };
        assert!(response.is_success());
        response.status = 404;
        assert!(!response.is_success());
    }

    #[test]
    fn test_waiter_outcome() {
        let mut waiter = Waiter::pending(
            RunId::new(),
            StepKey::new("approval", 0),
            "approve-1",
            Utc::now(),
            "tok".to_string(),
        );
        assert!(waiter.outcome().is_none());

        waiter.status = WaiterStatus::Notified;
        waiter.event_data = Some(json!({"approved": true}));
        assert_eq!(
            waiter.outcome().unwrap(),
            WaitEventResult {
                event_data: Some(json!({"approved": true})),
                timeout: false
            }
        );

        waiter.status = WaiterStatus::TimedOut;
        assert!(waiter.outcome().unwrap().timeout);
    }

    #[test]
    fn test_failure_context_from_call_failure() {
        let response = CallResponse {
            status: 503,
            header: BTreeMap::from([("retry-after".to_string(), vec!["5".to_string()])]),
            body: "unavailable".to_string(),
        };
        let failure = StepFailure::from_response(&response);
        let ctx = FailureContext::from_step(
            RunId("wfr_1".to_string()),
            "https://flows.example.com/workflows/order",
            Some(StepKey::new("charge", 0)),
            &failure,
        );
        assert_eq!(ctx.status, 503);
        assert_eq!(ctx.body, "unavailable");
        assert_eq!(ctx.header["retry-after"], vec!["5".to_string()]);
    }

    #[test]
    fn test_failure_context_from_step_error_defaults_to_500() {
        let ctx = FailureContext::from_step(
            RunId("wfr_1".to_string()),
            "https://flows.example.com/workflows/order",
            None,
            &StepFailure::message("boom"),
        );
        assert_eq!(ctx.status, 500);
        assert_eq!(ctx.body, "boom");
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["runId"], "wfr_1");
        assert!(value.get("failedStep").is_none());
    }
}
