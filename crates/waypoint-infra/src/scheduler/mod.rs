//! Durable scheduler adapters.
//!
//! - `http` -- REST client for a remote scheduler (production)
//! - `local` -- in-process queue with an HTTP dispatcher (development)
//!
//! [`SchedulerBackend`] picks one from [`SchedulerConfig`] so the engine can
//! be built over a single concrete type.

pub mod http;
pub mod local;

use secrecy::SecretString;
use waypoint_core::scheduler::DurableScheduler;
use waypoint_types::config::{BackoffConfig, SchedulerConfig, SchedulerKind};
use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{PublishReceipt, PublishRequest};

pub use http::HttpScheduler;
pub use local::LocalScheduler;

use crate::signature::RequestSigner;

/// The configured scheduler backend.
pub enum SchedulerBackend {
    Http(HttpScheduler),
    Local(LocalScheduler),
}

impl SchedulerBackend {
    /// Build the backend selected by `config`.
    ///
    /// The local backend signs deliveries with `signer` and retries failed
    /// deliveries with `backoff`.
    pub fn from_config(
        config: &SchedulerConfig,
        signer: RequestSigner,
        backoff: BackoffConfig,
    ) -> Result<Self, SchedulerError> {
        match config.kind {
            SchedulerKind::Http => {
                let url = config.url.as_deref().ok_or_else(|| {
                    SchedulerError::InvalidRequest(
                        "scheduler.url is required for the http scheduler".to_string(),
                    )
                })?;
                let token = config.token.clone().map(SecretString::from);
                tracing::info!(url, "using http scheduler");
                Ok(Self::Http(HttpScheduler::new(url, token)?))
            }
            SchedulerKind::Local => {
                tracing::warn!("using local in-process scheduler; pending messages are lost on restart");
                Ok(Self::Local(LocalScheduler::new(signer, backoff)?))
            }
        }
    }

    /// The local dispatcher, if this backend needs one running.
    pub fn local(&self) -> Option<&LocalScheduler> {
        match self {
            Self::Local(local) => Some(local),
            Self::Http(_) => None,
        }
    }
}

impl DurableScheduler for SchedulerBackend {
    async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, SchedulerError> {
        match self {
            Self::Http(s) => s.publish(request).await,
            Self::Local(s) => s.publish(request).await,
        }
    }

    async fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Result<Vec<PublishReceipt>, SchedulerError> {
        match self {
            Self::Http(s) => s.batch_publish(requests).await,
            Self::Local(s) => s.batch_publish(requests).await,
        }
    }

    async fn cancel(&self, message_ids: &[String]) -> Result<u64, SchedulerError> {
        match self {
            Self::Http(s) => s.cancel(message_ids).await,
            Self::Local(s) => s.cancel(message_ids).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_backend_requires_url() {
        let config = SchedulerConfig::default();
        let result = SchedulerBackend::from_config(&config, RequestSigner::default(), BackoffConfig::default());
        assert!(matches!(result, Err(SchedulerError::InvalidRequest(_))));
    }

    #[test]
    fn test_backend_selection() {
        let http = SchedulerConfig {
            kind: SchedulerKind::Http,
            url: Some("https://scheduler.example.com".to_string()),
            token: Some("tok".to_string()),
        };
        let backend = SchedulerBackend::from_config(&http, RequestSigner::default(), BackoffConfig::default()).unwrap();
        assert!(backend.local().is_none());

        let local = SchedulerConfig {
            kind: SchedulerKind::Local,
            ..Default::default()
        };
        let backend = SchedulerBackend::from_config(&local, RequestSigner::default(), BackoffConfig::default()).unwrap();
        assert!(backend.local().is_some());
    }

    #[tokio::test]
    async fn test_local_backend_delegates_to_queue() {
        let config = SchedulerConfig {
            kind: SchedulerKind::Local,
            ..Default::default()
        };
        let backend = SchedulerBackend::from_config(&config, RequestSigner::default(), BackoffConfig::default()).unwrap();
        let receipt = backend
            .publish(PublishRequest::post("http://localhost:1/wf", Vec::new()).deduplication_id("d"))
            .await
            .unwrap();
        let again = backend
            .publish(PublishRequest::post("http://localhost:1/wf", Vec::new()).deduplication_id("d"))
            .await
            .unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.message_id, receipt.message_id);
        assert_eq!(backend.local().unwrap().queue().len(), 1);
    }
}
