//! Durable scheduler port.
//!
//! The durable scheduler is an external at-least-once message queue. The
//! engine only ever publishes to it (now, delayed, in batches, with retries
//! and callbacks) and asks it to cancel messages; delivery happens by the
//! scheduler POSTing back to a workflow endpoint.

pub mod memory;

use waypoint_types::error::SchedulerError;
use waypoint_types::scheduler::{PublishReceipt, PublishRequest};

/// Trait implemented by every durable scheduler backend.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DurableScheduler: Send + Sync {
    /// Publish one message. Returns its message id.
    fn publish(
        &self,
        request: PublishRequest,
    ) -> impl std::future::Future<Output = Result<PublishReceipt, SchedulerError>> + Send;

    /// Publish several messages in one call. Receipts are returned in order.
    fn batch_publish(
        &self,
        requests: Vec<PublishRequest>,
    ) -> impl std::future::Future<Output = Result<Vec<PublishReceipt>, SchedulerError>> + Send;

    /// Cancel not-yet-delivered messages. Returns how many were canceled.
    fn cancel(
        &self,
        message_ids: &[String],
    ) -> impl std::future::Future<Output = Result<u64, SchedulerError>> + Send;
}
