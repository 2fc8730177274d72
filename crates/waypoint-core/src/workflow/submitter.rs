//! Step submitter: turns newly reached steps into scheduler messages.
//!
//! Every self-invocation carries only a durable pointer (`Envelope`: run id,
//! delivery token, what happened). Deduplication ids are derived from the
//! delivery token so a redelivered invocation that republishes the same
//! message is collapsed by the scheduler.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use waypoint_types::envelope::{
    Delivery, Envelope, HEADER_CALLBACK, HEADER_CALLBACK_ENVELOPE, HEADER_INIT,
    HEADER_PROTOCOL_VERSION, HEADER_RUN_ID, PROTOCOL_VERSION,
};
use waypoint_types::scheduler::{CallbackTarget, Delay, PublishRequest};
use waypoint_types::workflow::{CallRequest, FailureContext, RunId, StepKey};

/// Work handed to the scheduler for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Wake a SLEEP / SLEEP_UNTIL step at `wake_at`.
    Wake {
        step: StepKey,
        token: String,
        wake_at: DateTime<Utc>,
    },
    /// Run another attempt of a RUN step after `delay`.
    Retry {
        step: StepKey,
        token: String,
        delay: Duration,
    },
    /// Execute a RUN member of a parallel batch in its own invocation.
    Branch { step: StepKey, token: String },
    /// Proxy a third-party request and call back with the response.
    Call {
        step: StepKey,
        token: String,
        request: CallRequest,
    },
    /// Register a waiter and schedule its timeout.
    Wait {
        step: StepKey,
        token: String,
        event_id: String,
        timeout_at: DateTime<Utc>,
    },
}

impl Submission {
    pub fn step(&self) -> &StepKey {
        match self {
            Submission::Wake { step, .. }
            | Submission::Retry { step, .. }
            | Submission::Branch { step, .. }
            | Submission::Call { step, .. }
            | Submission::Wait { step, .. } => step,
        }
    }
}

fn json_headers(request: PublishRequest) -> PublishRequest {
    request
        .header("content-type", "application/json")
        .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
}

/// Builds publish requests on behalf of one run.
pub struct Submitter<'a> {
    run_id: &'a RunId,
    workflow_url: &'a str,
    /// Delivery retries for self-invocations.
    retries: u32,
}

impl<'a> Submitter<'a> {
    pub fn new(run_id: &'a RunId, workflow_url: &'a str, retries: u32) -> Self {
        Self {
            run_id,
            workflow_url,
            retries,
        }
    }

    /// A continuation of this run delivered back to the workflow endpoint.
    pub fn self_invocation(&self, token: &str, delivery: Delivery, delay: Delay) -> PublishRequest {
        let dedup = format!("{token}:{}", delivery.label());
        let envelope = Envelope::new(self.run_id.clone(), token, delivery);
        json_headers(PublishRequest::post(self.workflow_url, envelope.to_bytes()))
            .header(HEADER_INIT, "false")
            .header(HEADER_RUN_ID, self.run_id.to_string())
            .delay(delay)
            .retries(self.retries)
            .deduplication_id(dedup)
    }

    /// The outbound third-party request of a CALL step.
    pub fn call(&self, token: &str, step: &StepKey, call: &CallRequest) -> PublishRequest {
        let envelope = Envelope::new(
            self.run_id.clone(),
            token,
            Delivery::CallResult { step: step.clone() },
        );
        let callback = CallbackTarget {
            url: self.workflow_url.to_string(),
            headers: BTreeMap::from([
                (HEADER_CALLBACK.to_string(), "true".to_string()),
                (HEADER_RUN_ID.to_string(), self.run_id.to_string()),
                (HEADER_CALLBACK_ENVELOPE.to_string(), envelope.to_header_value()),
                (HEADER_PROTOCOL_VERSION.to_string(), PROTOCOL_VERSION.to_string()),
            ]),
        };

        let mut request = PublishRequest::post(
            &call.url,
            call.body.clone().map(String::into_bytes).unwrap_or_default(),
        );
        request.method = call.method.to_uppercase();
        for (name, value) in &call.headers {
            request = request.header(name, value.clone());
        }
        request.retries = call.retries;
        request.timeout_secs = call.timeout_secs;
        request.callback = Some(callback.clone());
        request.failure_callback = Some(callback);
        request.deduplication_id = Some(format!("{token}:call"));
        request
    }

    /// Publish request for one submission. `Wait` yields its timeout message.
    pub fn for_submission(&self, submission: &Submission) -> PublishRequest {
        match submission {
            Submission::Wake {
                step,
                token,
                wake_at,
            } => self.self_invocation(token, Delivery::Wake { step: step.clone() }, Delay::At(*wake_at)),
            Submission::Retry { step, token, delay } => self.self_invocation(
                token,
                Delivery::Retry { step: step.clone() },
                Delay::Seconds(delay.as_secs_f64().ceil() as u64),
            ),
            Submission::Branch { step, token } => {
                self.self_invocation(token, Delivery::Branch { step: step.clone() }, Delay::Now)
            }
            Submission::Call {
                step,
                token,
                request,
            } => self.call(token, step, request),
            Submission::Wait {
                step,
                token,
                timeout_at,
                ..
            } => self.self_invocation(
                token,
                Delivery::WaitTimeout { step: step.clone() },
                Delay::At(*timeout_at),
            ),
        }
    }
}

/// The message POSTed to a failure URL.
pub fn failure_notice(url: &str, failure: &FailureContext, retries: u32) -> PublishRequest {
    json_headers(PublishRequest::post(
        url,
        serde_json::to_vec(failure).unwrap_or_default(),
    ))
    .header(HEADER_RUN_ID, failure.run_id.to_string())
    .retries(retries)
    .deduplication_id(format!("failure:{}", failure.run_id))
}

/// The first invocation of a run, published through the scheduler.
pub fn trigger_request(workflow_url: &str, run_id: &RunId, payload: Vec<u8>) -> PublishRequest {
    json_headers(PublishRequest::post(workflow_url, payload))
        .header(HEADER_INIT, "true")
        .header(HEADER_RUN_ID, run_id.to_string())
        .deduplication_id(format!("trigger:{run_id}"))
}
