//! Messages handed to the durable scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a published message becomes deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Delay {
    #[default]
    Now,
    Seconds(u64),
    At(DateTime<Utc>),
}

impl Delay {
    /// Absolute delivery time relative to `now`.
    pub fn deliver_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Delay::Now => now,
            Delay::Seconds(secs) => now + chrono::Duration::seconds(*secs as i64),
            Delay::At(at) => (*at).max(now),
        }
    }
}

/// Where the scheduler reports the outcome of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// One message to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// URL the scheduler delivers to.
    pub destination: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub delay: Delay,
    /// Delivery retries after the first attempt.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_callback: Option<CallbackTarget>,
    /// Messages sharing a deduplication id are only accepted once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PublishRequest {
    /// A POST of `body` to `destination`, delivered immediately.
    pub fn post(destination: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            destination: destination.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body,
            delay: Delay::Now,
            retries: 0,
            callback: None,
            failure_callback: None,
            deduplication_id: None,
            timeout_secs: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }
}

/// What the scheduler returned for one accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub message_id: String,
    /// True if an earlier message with the same deduplication id was kept.
    #[serde(default)]
    pub deduplicated: bool,
}
