//! In-process scheduler for local development.
//!
//! Wraps the core [`InMemoryScheduler`] queue with a dispatcher loop that
//! delivers due messages over HTTP. Workflow deliveries are signed with the
//! current signing key. Messages with a callback are proxied to the third
//! party and their response is published back as a callback message.
//! Nothing survives a restart: use the HTTP scheduler in production.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use waypoint_core::scheduler::DurableScheduler;
use waypoint_core::scheduler::memory::{InMemoryScheduler, ScheduledMessage};
use waypoint_core::workflow::retry::RetryHandler;
use waypoint_types::config::BackoffConfig;
use waypoint_types::envelope::{HEADER_MESSAGE_ID, HEADER_SIGNATURE};
use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{PublishReceipt, PublishRequest};
use waypoint_types::workflow::HeaderValues;

use crate::signature::RequestSigner;

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_POLL: Duration = Duration::from_secs(60);
const CALLBACK_RETRIES: u32 = 3;

/// Status reported to the failure callback when the destination could not be reached.
const UNREACHABLE_STATUS: u16 = 502;

/// What came back from one delivery attempt.
struct Delivered {
    status: u16,
    header: HeaderValues,
    body: Vec<u8>,
}

/// Queue plus HTTP dispatcher. Cloning shares the queue.
#[derive(Clone)]
pub struct LocalScheduler {
    queue: InMemoryScheduler,
    client: reqwest::Client,
    signer: RequestSigner,
    backoff: BackoffConfig,
}

impl LocalScheduler {
    pub fn new(signer: RequestSigner, backoff: BackoffConfig) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SchedulerError::InvalidRequest(format!("failed to build http client: {e}")))?;
        Ok(Self {
            queue: InMemoryScheduler::new(),
            client,
            signer,
            backoff,
        })
    }

    /// The underlying queue.
    pub fn queue(&self) -> &InMemoryScheduler {
        &self.queue
    }

    /// Deliver due messages until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("local scheduler dispatcher started");
        loop {
            for message in self.queue.take_due(Utc::now()) {
                let this = self.clone();
                tokio::spawn(async move { this.deliver(message).await });
            }

            let sleep = self
                .queue
                .next_due_at()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_POLL);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        tracing::info!(pending = self.queue.len(), "local scheduler dispatcher stopped");
    }

    /// Deliver every due message inline, including callbacks and retries
    /// that become due meanwhile, until nothing is due.
    ///
    /// Short-lived processes (CLI commands) use this instead of [`run`](Self::run).
    /// Returns how many deliveries were made.
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            let due = self.queue.take_due(Utc::now());
            if due.is_empty() {
                break;
            }
            for message in due {
                self.deliver(message).await;
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, message: ScheduledMessage) {
        let outcome = self.send(&message).await;
        if message.is_call() {
            self.settle_call(message, outcome).await;
            return;
        }

        match outcome {
            Ok(delivered) if is_success(delivered.status) => {
                tracing::debug!(
                    message_id = %message.message_id,
                    status = delivered.status,
                    "message delivered"
                );
            }
            Ok(delivered) => {
                let reason = format!("status {}", delivered.status);
                self.retry_or_dead_letter(message, &reason);
            }
            Err(e) => self.retry_or_dead_letter(message, &e),
        }
    }

    async fn send(&self, message: &ScheduledMessage) -> Result<Delivered, String> {
        let request = &message.request;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("invalid method {}: {e}", request.method))?;
        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DELIVERY_TIMEOUT);

        let mut builder = self
            .client
            .request(method, &request.destination)
            .timeout(timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !message.is_call() {
            builder = builder.header(HEADER_MESSAGE_ID, &message.message_id);
            if let Some(signature) = self.signer.sign(&request.body).map_err(|e| e.to_string())? {
                builder = builder.header(HEADER_SIGNATURE, signature);
            }
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let mut header = HeaderValues::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                header
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();
        Ok(Delivered { status, header, body })
    }

    async fn settle_call(&self, message: ScheduledMessage, outcome: Result<Delivered, String>) {
        let delivered = match outcome {
            Ok(delivered) if is_success(delivered.status) => {
                self.publish_callback(&message, delivered, false).await;
                return;
            }
            Ok(delivered) => delivered,
            Err(e) => Delivered {
                status: UNREACHABLE_STATUS,
                header: BTreeMap::new(),
                body: e.into_bytes(),
            },
        };

        if message.attempts < message.request.retries {
            let delay = RetryHandler::backoff(&self.backoff, message.attempts + 1);
            tracing::debug!(
                message_id = %message.message_id,
                status = delivered.status,
                attempt = message.attempts + 1,
                "call failed, retrying"
            );
            self.requeue_after(message, delay);
        } else {
            self.publish_callback(&message, delivered, true).await;
        }
    }

    async fn publish_callback(&self, message: &ScheduledMessage, delivered: Delivered, failure: bool) {
        let Some(callback) =
            message.callback_request(delivered.status, delivered.header, &delivered.body, failure)
        else {
            tracing::warn!(message_id = %message.message_id, failure, "call has no callback target");
            return;
        };

        let mut request = PublishRequest::post(callback.url, callback.body).retries(CALLBACK_RETRIES);
        for (name, value) in callback.headers {
            if name != HEADER_MESSAGE_ID {
                request = request.header(&name, value);
            }
        }
        if let Err(e) = self.queue.publish(request).await {
            tracing::error!(message_id = %message.message_id, error = %e, "failed to publish callback");
        }
    }

    fn retry_or_dead_letter(&self, message: ScheduledMessage, reason: &str) {
        if message.attempts < message.request.retries {
            let delay = RetryHandler::backoff(&self.backoff, message.attempts + 1);
            tracing::debug!(
                message_id = %message.message_id,
                reason,
                attempt = message.attempts + 1,
                "delivery failed, retrying"
            );
            self.requeue_after(message, delay);
        } else {
            tracing::warn!(message_id = %message.message_id, reason, "delivery failed");
            self.queue.dead_letter(message);
        }
    }

    fn requeue_after(&self, message: ScheduledMessage, delay: Duration) {
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.queue.requeue(message, at);
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

impl DurableScheduler for LocalScheduler {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, SchedulerError> {
        self.queue.publish(request).await
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<PublishReceipt>, SchedulerError> {
        self.queue.batch_publish(requests).await
    }

    async fn cancel(&self, message_ids: &[String]) -> Result<u64, SchedulerError> {
        self.queue.cancel(message_ids).await
    }
}
