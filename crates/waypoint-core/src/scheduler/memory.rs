//! In-memory durable scheduler.
//!
//! Holds published messages in a queue until someone takes them. Tests take
//! messages explicitly (in any order, ignoring delays) to simulate arbitrary
//! delivery interleavings; the local dispatcher in waypoint-infra takes due
//! messages and delivers them over HTTP.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use waypoint_types::envelope::{CallbackPayload, HEADER_FAILURE_CALLBACK, HEADER_MESSAGE_ID, InboundRequest};
use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{CallbackTarget, PublishReceipt, PublishRequest};

use super::DurableScheduler;

/// A message accepted by the scheduler and not yet delivered.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub message_id: String,
    pub request: PublishRequest,
    pub deliver_at: DateTime<Utc>,
    /// Delivery attempts already made.
    pub attempts: u32,
}

impl ScheduledMessage {
    /// The HTTP request the scheduler would send to the destination.
    pub fn to_inbound(&self) -> InboundRequest {
        let mut request = InboundRequest::new(&self.request.destination, self.request.body.clone());
        for (name, value) in &self.request.headers {
            request = request.with_header(name, value.clone());
        }
        request.with_header(HEADER_MESSAGE_ID, self.message_id.clone())
    }

    /// Callback the scheduler would send after proxying this message.
    ///
    /// Uses the failure callback when `failure` is set (retries exhausted).
    /// Returns `None` if the message has no matching callback target.
    pub fn callback_request(
        &self,
        status: u16,
        header: BTreeMap<String, Vec<String>>,
        body: &[u8],
        failure: bool,
    ) -> Option<InboundRequest> {
        let target: &CallbackTarget = if failure {
            self.request.failure_callback.as_ref()?
        } else {
            self.request.callback.as_ref()?
        };
        let payload = CallbackPayload {
            status,
            header,
            body: body.to_vec(),
        };
        let mut request = InboundRequest::new(
            &target.url,
            serde_json::to_vec(&payload).unwrap_or_default(),
        );
        for (name, value) in &target.headers {
            request = request.with_header(name, value.clone());
        }
        if failure {
            request = request.with_header(HEADER_FAILURE_CALLBACK, "true");
        }
        Some(request.with_header(HEADER_MESSAGE_ID, format!("{}-callback", self.message_id)))
    }

    /// Whether this message is proxied to a third party (it has a callback).
    pub fn is_call(&self) -> bool {
        self.request.callback.is_some()
    }
}

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    queue: Vec<ScheduledMessage>,
    dedup: HashMap<String, String>,
    canceled: HashSet<String>,
    dead_letters: Vec<ScheduledMessage>,
}

/// Queue-backed scheduler. Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct InMemoryScheduler {
    state: Arc<Mutex<SchedulerState>>,
    wakeup: Arc<Notify>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn accept(state: &mut SchedulerState, request: PublishRequest) -> PublishReceipt {
        if let Some(dedup_id) = &request.deduplication_id {
            if let Some(existing) = state.dedup.get(dedup_id) {
                return PublishReceipt {
                    message_id: existing.clone(),
                    deduplicated: true,
                };
            }
        }
        state.next_id += 1;
        let message_id = format!("msg_{:06}", state.next_id);
        if let Some(dedup_id) = &request.deduplication_id {
            state.dedup.insert(dedup_id.clone(), message_id.clone());
        }
        let deliver_at = request.delay.deliver_at(Utc::now());
        state.queue.push(ScheduledMessage {
            message_id: message_id.clone(),
            request,
            deliver_at,
            attempts: 0,
        });
        PublishReceipt {
            message_id,
            deduplicated: false,
        }
    }

    /// Snapshot of queued messages in publish order.
    pub fn pending(&self) -> Vec<ScheduledMessage> {
        self.lock().queue.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one queued message by id.
    pub fn take(&self, message_id: &str) -> Option<ScheduledMessage> {
        let mut state = self.lock();
        let index = state.queue.iter().position(|m| m.message_id == message_id)?;
        Some(state.queue.remove(index))
    }

    /// Remove every queued message regardless of its delay.
    pub fn take_all(&self) -> Vec<ScheduledMessage> {
        std::mem::take(&mut self.lock().queue)
    }

    /// Remove the messages whose delivery time has come, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledMessage> {
        let mut state = self.lock();
        let (mut due, rest): (Vec<_>, Vec<_>) =
            state.queue.drain(..).partition(|m| m.deliver_at <= now);
        state.queue = rest;
        due.sort_by(|a, b| a.deliver_at.cmp(&b.deliver_at));
        due
    }

    /// Earliest delivery time among queued messages.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.iter().map(|m| m.deliver_at).min()
    }

    /// Put a message back for another delivery attempt at `deliver_at`.
    pub fn requeue(&self, mut message: ScheduledMessage, deliver_at: DateTime<Utc>) {
        message.attempts += 1;
        message.deliver_at = deliver_at;
        let mut state = self.lock();
        if state.canceled.contains(&message.message_id) {
            return;
        }
        state.queue.push(message);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Park a message whose retries are exhausted.
    pub fn dead_letter(&self, message: ScheduledMessage) {
        tracing::warn!(
            message_id = %message.message_id,
            destination = %message.request.destination,
            attempts = message.attempts,
            "message moved to dead letter queue"
        );
        self.lock().dead_letters.push(message);
    }

    pub fn dead_letters(&self) -> Vec<ScheduledMessage> {
        self.lock().dead_letters.clone()
    }

    /// Resolves when a message is published or requeued.
    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }
}

impl DurableScheduler for InMemoryScheduler {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, SchedulerError> {
        if request.destination.is_empty() {
            return Err(SchedulerError::InvalidRequest("empty destination".to_string()));
        }
        let receipt = {
            let mut state = self.lock();
            Self::accept(&mut state, request)
        };
        self.wakeup.notify_one();
        Ok(receipt)
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<PublishReceipt>, SchedulerError> {
        if requests.iter().any(|r| r.destination.is_empty()) {
            return Err(SchedulerError::InvalidRequest("empty destination".to_string()));
        }
        let receipts = {
            let mut state = self.lock();
            requests
                .into_iter()
                .map(|request| Self::accept(&mut state, request))
                .collect()
        };
        self.wakeup.notify_one();
        Ok(receipts)
    }

    async fn cancel(&self, message_ids: &[String]) -> Result<u64, SchedulerError> {
        let mut state = self.lock();
        let before = state.queue.len();
        state.queue.retain(|m| !message_ids.contains(&m.message_id));
        state.canceled.extend(message_ids.iter().cloned());
        Ok((before - state.queue.len()) as u64)
    }
}
