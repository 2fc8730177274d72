//! Wire format of workflow endpoint invocations.
//!
//! A first invocation carries the raw trigger payload. Every continuation
//! carries a small JSON `Envelope` that points at durable state
//! (`run_id` + delivery token + what happened) instead of the full ledger.
//! CALL responses arrive as scheduler callbacks whose body is a
//! `CallbackPayload` and whose routing envelope travels in a header.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::workflow::{CallResponse, HeaderValues, RunId, StepKey};

pub const PROTOCOL_VERSION: &str = "1";

pub const HEADER_INIT: &str = "waypoint-workflow-init";
pub const HEADER_RUN_ID: &str = "waypoint-workflow-run-id";
pub const HEADER_MESSAGE_ID: &str = "waypoint-message-id";
pub const HEADER_SIGNATURE: &str = "waypoint-signature";
pub const HEADER_CALLBACK: &str = "waypoint-callback";
pub const HEADER_FAILURE_CALLBACK: &str = "waypoint-failure-callback";
pub const HEADER_CALLBACK_ENVELOPE: &str = "waypoint-callback-envelope";
pub const HEADER_PROTOCOL_VERSION: &str = "waypoint-protocol-version";

/// Token used by the first invocation of a run.
pub fn init_token(run_id: &RunId) -> String {
    format!("init-{run_id}")
}

/// What a continuation message reports to the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    /// Plain replay with no new fact attached.
    Resume,
    /// A SLEEP / SLEEP_UNTIL step reached its wake time.
    Wake { step: StepKey },
    /// Another attempt of a failed RUN step is due.
    Retry { step: StepKey },
    /// Execute one RUN member of a parallel batch.
    Branch { step: StepKey },
    /// A WAIT_FOR_EVENT step hit its timeout.
    WaitTimeout { step: StepKey },
    /// A waiter of this run was notified.
    Notified { step: StepKey },
    /// A CALL step's third-party response arrived.
    CallResult { step: StepKey },
}

impl Delivery {
    pub fn step(&self) -> Option<&StepKey> {
        match self {
            Delivery::Resume => None,
            Delivery::Wake { step }
            | Delivery::Retry { step }
            | Delivery::Branch { step }
            | Delivery::WaitTimeout { step }
            | Delivery::Notified { step }
            | Delivery::CallResult { step } => Some(step),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Delivery::Resume => "resume",
            Delivery::Wake { .. } => "wake",
            Delivery::Retry { .. } => "retry",
            Delivery::Branch { .. } => "branch",
            Delivery::WaitTimeout { .. } => "wait_timeout",
            Delivery::Notified { .. } => "notified",
            Delivery::CallResult { .. } => "call_result",
        }
    }
}

/// Body of every continuation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub run_id: RunId,
    /// Delivery token; must match the step's owner token to drive it.
    pub token: String,
    pub delivery: Delivery,
}

impl Envelope {
    pub fn new(run_id: RunId, token: impl Into<String>, delivery: Delivery) -> Self {
        Self {
            run_id,
            token: token.into(),
            delivery,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain strings and enums cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::InvalidBody(e.to_string()))
    }

    /// Compact header form used to route CALL callbacks back to their step.
    pub fn to_header_value(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn from_header_value(value: &str) -> Result<Self, EnvelopeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(value.trim().as_bytes())
            .map_err(|e| EnvelopeError::InvalidHeader {
                header: HEADER_CALLBACK_ENVELOPE,
                reason: e.to_string(),
            })?;
        Self::from_bytes(&bytes)
    }
}

/// Body the scheduler POSTs back after performing a CALL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub status: u16,
    #[serde(default)]
    pub header: HeaderValues,
    /// Response body, base64-encoded.
    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub body: Vec<u8>,
}

impl CallbackPayload {
    pub fn into_response(self) -> CallResponse {
        CallResponse {
            status: self.status,
            header: self.header,
            body: String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

/// Transport-neutral view of an HTTP request to a workflow endpoint.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub url: String,
    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// How an inbound request should be handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// First invocation; the body is the trigger payload.
    Init { run_id: Option<RunId> },
    /// Continuation carrying an envelope.
    Continuation(Envelope),
    /// Scheduler callback reporting a CALL response.
    Callback {
        envelope: Envelope,
        payload: CallbackPayload,
        failure: bool,
    },
}

impl InboundRequest {
    pub fn new(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(HEADER_MESSAGE_ID)
    }

    fn flag(&self, name: &'static str) -> Result<Option<bool>, EnvelopeError> {
        match self.header(name).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) if v == "true" => Ok(Some(true)),
            Some(v) if v == "false" => Ok(Some(false)),
            Some(v) => Err(EnvelopeError::InvalidHeader {
                header: name,
                reason: format!("expected true|false, got '{v}'"),
            }),
        }
    }

    /// Classify the request by its headers and body shape.
    pub fn classify(&self) -> Result<Invocation, EnvelopeError> {
        if let Some(version) = self.header(HEADER_PROTOCOL_VERSION) {
            if version.trim() != PROTOCOL_VERSION {
                return Err(EnvelopeError::UnsupportedVersion(version.to_string()));
            }
        }

        let run_id_header = self
            .header(HEADER_RUN_ID)
            .map(str::parse::<RunId>)
            .transpose()
            .map_err(|reason| EnvelopeError::InvalidHeader {
                header: HEADER_RUN_ID,
                reason,
            })?;

        if self.flag(HEADER_CALLBACK)?.unwrap_or(false) {
            let raw = self
                .header(HEADER_CALLBACK_ENVELOPE)
                .ok_or(EnvelopeError::MissingHeader(HEADER_CALLBACK_ENVELOPE))?;
            let envelope = Envelope::from_header_value(raw)?;
            if !matches!(envelope.delivery, Delivery::CallResult { .. }) {
                return Err(EnvelopeError::InvalidBody(
                    "callback envelope must carry a call_result delivery".to_string(),
                ));
            }
            let payload: CallbackPayload = serde_json::from_slice(&self.body)
                .map_err(|e| EnvelopeError::InvalidBody(e.to_string()))?;
            let failure = self.flag(HEADER_FAILURE_CALLBACK)?.unwrap_or(false);
            return Ok(Invocation::Callback {
                envelope,
                payload,
                failure,
            });
        }

        if self.flag(HEADER_INIT)?.unwrap_or(true) {
            return Ok(Invocation::Init {
                run_id: run_id_header,
            });
        }

        let run_id = run_id_header.ok_or(EnvelopeError::MissingHeader(HEADER_RUN_ID))?;
        let envelope = Envelope::from_bytes(&self.body)?;
        if envelope.run_id != run_id {
            return Err(EnvelopeError::RunIdMismatch {
                header: run_id,
                body: envelope.run_id,
            });
        }
        Ok(Invocation::Continuation(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn continuation(envelope: &Envelope) -> InboundRequest {
        InboundRequest::new("https://flows.example.com/workflows/order", envelope.to_bytes())
            .with_header(HEADER_INIT, "false")
            .with_header(HEADER_RUN_ID, envelope.run_id.to_string())
    }

    #[test]
    fn test_delivery_wire_shape() {
        let envelope = Envelope::new(
            RunId("wfr_1".to_string()),
            "tok",
            Delivery::Wake {
                step: StepKey::new("nap", 0),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "runId": "wfr_1",
                "token": "tok",
                "delivery": {"type": "wake", "step": {"name": "nap", "occurrence": 0}}
            })
        );
    }

    #[test]
    fn test_classify_first_invocation_without_headers() {
        let request = InboundRequest::new("https://x/workflows/a", b"{}".to_vec());
        assert_eq!(request.classify().unwrap(), Invocation::Init { run_id: None });
    }

    #[test]
    fn test_classify_first_invocation_with_run_id() {
        let request = InboundRequest::new("https://x/workflows/a", b"{}".to_vec())
            .with_header("Waypoint-Workflow-Run-Id", "wfr_custom");
        assert_eq!(
            request.classify().unwrap(),
            Invocation::Init {
                run_id: Some(RunId("wfr_custom".to_string()))
            }
        );
    }

    #[test]
    fn test_classify_continuation() {
        let envelope = Envelope::new(RunId("wfr_2".to_string()), "t", Delivery::Resume);
        assert_eq!(
            continuation(&envelope).classify().unwrap(),
            Invocation::Continuation(envelope)
        );
    }

    #[test]
    fn test_classify_continuation_requires_run_id() {
        let envelope = Envelope::new(RunId("wfr_2".to_string()), "t", Delivery::Resume);
        let request = InboundRequest::new("https://x", envelope.to_bytes())
            .with_header(HEADER_INIT, "false");
        assert!(matches!(
            request.classify(),
            Err(EnvelopeError::MissingHeader(HEADER_RUN_ID))
        ));
    }

    #[test]
    fn test_classify_rejects_run_id_mismatch() {
        let envelope = Envelope::new(RunId("wfr_2".to_string()), "t", Delivery::Resume);
        let request = continuation(&envelope).with_header(HEADER_RUN_ID, "wfr_other");
        assert!(matches!(
            request.classify(),
            Err(EnvelopeError::RunIdMismatch { .. })
        ));
    }

    #[test]
    fn test_classify_rejects_malformed_body() {
        let request = InboundRequest::new("https://x", b"not json".to_vec())
            .with_header(HEADER_INIT, "false")
            .with_header(HEADER_RUN_ID, "wfr_3");
        assert!(matches!(
            request.classify(),
            Err(EnvelopeError::InvalidBody(_))
        ));
    }

    #[test]
    fn test_classify_rejects_unknown_protocol_version() {
        let request = InboundRequest::new("https://x", Vec::new())
            .with_header(HEADER_PROTOCOL_VERSION, "2");
        assert!(matches!(
            request.classify(),
            Err(EnvelopeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_classify_callback() {
        let envelope = Envelope::new(
            RunId("wfr_4".to_string()),
            "tok",
            Delivery::CallResult {
                step: StepKey::new("fetch", 0),
            },
        );
        let body = json!({"status": 200, "header": {"content-type": ["text/plain"]}, "body": "b2s="});
        let request = InboundRequest::new("https://x", body.to_string().into_bytes())
            .with_header(HEADER_CALLBACK, "true")
            .with_header(HEADER_CALLBACK_ENVELOPE, envelope.to_header_value());

        match request.classify().unwrap() {
            Invocation::Callback {
                envelope: parsed,
                payload,
                failure,
            } => {
                assert_eq!(parsed, envelope);
                assert!(!failure);
                let response = payload.into_response();
                assert_eq!(response.status, 200);
                assert_eq!(response.body, "ok");
            }
            other => panic!("expected callback, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_callback_requires_call_result_delivery() {
        let envelope = Envelope::new(RunId("wfr_4".to_string()), "tok", Delivery::Resume);
        let request = InboundRequest::new("https://x", br#"{"status":200}"#.to_vec())
            .with_header(HEADER_CALLBACK, "true")
            .with_header(HEADER_CALLBACK_ENVELOPE, envelope.to_header_value());
        assert!(request.classify().is_err());
    }

    #[test]
    fn test_invalid_flag_value() {
        let request = InboundRequest::new("https://x", Vec::new()).with_header(HEADER_INIT, "maybe");
        assert!(matches!(
            request.classify(),
            Err(EnvelopeError::InvalidHeader { .. })
        ));
    }
}
