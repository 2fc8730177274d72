//! Run-level failure handling.
//!
//! When a run cannot make progress it moves to FAILED_PENDING_CALLBACK with a
//! `FailureContext`. The handler then tries, in order of precedence, the
//! in-process failure function and the failure URL. Success of either (or
//! having neither) moves the run to FAILED; an error leaves it pending so the
//! next redelivery tries again.

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use waypoint_types::workflow::FailureContext;

/// In-process failure callback.
///
/// Returning `Ok` settles the run as FAILED and stores the returned value as
/// the failure response. Returning `Err` keeps the run pending.
pub trait FailureFunction: Send + Sync {
    fn on_failure<'a>(&'a self, failure: &'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>>;
}

impl<F> FailureFunction for F
where
    F: for<'a> Fn(&'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>> + Send + Sync,
{
    fn on_failure<'a>(&'a self, failure: &'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>> {
        (self)(failure)
    }
}

/// Which failure route applies to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRoute {
    Function,
    Url(String),
    None,
}

impl FailureRoute {
    /// The failure function takes precedence over the failure URL.
    pub fn select(has_function: bool, failure_url: Option<&str>) -> Self {
        match (has_function, failure_url) {
            (true, _) => FailureRoute::Function,
            (false, Some(url)) => FailureRoute::Url(url.to_string()),
            (false, None) => FailureRoute::None,
        }
    }
}

/// Failure response stored after publishing to the failure URL.
pub fn url_delivery_response(url: &str, message_id: &str) -> Value {
    json!({ "failureUrl": url, "messageId": message_id })
}
