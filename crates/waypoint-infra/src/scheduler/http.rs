//! REST client for a remote durable scheduler.
//!
//! The scheduler exposes three JSON endpoints under its base URL:
//! `POST /v1/publish`, `POST /v1/batch` and `POST /v1/cancel`. Requests
//! carry the configured token as a bearer credential.
//!
//! # Token Security
//!
//! The token is stored as a [`SecretString`] and is only exposed when the
//! `Authorization` header is built. It never appears in Debug output or logs.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use waypoint_core::scheduler::DurableScheduler;
use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{PublishReceipt, PublishRequest};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest<'a> {
    message_ids: &'a [String],
}

#[derive(Deserialize)]
struct CancelResponse {
    canceled: u64,
}

/// Durable scheduler reached over HTTP.
pub struct HttpScheduler {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScheduler")
            .field("base_url", &self.base_url)
            .field("token", &self.token.is_some())
            .finish()
    }
}

impl HttpScheduler {
    /// Create a client for the scheduler at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SchedulerError::InvalidRequest(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, SchedulerError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(path, status = status.as_u16(), "scheduler rejected request");
            return Err(SchedulerError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| SchedulerError::InvalidResponse(e.to_string()))
    }
}

impl DurableScheduler for HttpScheduler {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, SchedulerError> {
        let receipt: PublishReceipt = self.post_json("/v1/publish", &request).await?;
        tracing::debug!(
            message_id = %receipt.message_id,
            destination = %request.destination,
            deduplicated = receipt.deduplicated,
            "message published"
        );
        Ok(receipt)
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<PublishReceipt>, SchedulerError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let receipts: Vec<PublishReceipt> = self.post_json("/v1/batch", &requests).await?;
        if receipts.len() != requests.len() {
            return Err(SchedulerError::InvalidResponse(format!(
                "expected {} receipts, got {}",
                requests.len(),
                receipts.len()
            )));
        }
        tracing::debug!(count = receipts.len(), "batch published");
        Ok(receipts)
    }

    async fn cancel(&self, message_ids: &[String]) -> Result<u64, SchedulerError> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let response: CancelResponse = self
            .post_json("/v1/cancel", &CancelRequest { message_ids })
            .await?;
        Ok(response.canceled)
    }
}
