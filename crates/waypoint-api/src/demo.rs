//! Workflows registered by the `wpt` server.
//!
//! - `onboarding` -- memoized steps, a sleep and an event wait with timeout
//! - `fan-out` -- a parallel batch of RUN steps plus an optional CALL
//! - `flaky` -- a failing step with retries and a failure function

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use waypoint_core::workflow::{FailureFunction, ParallelBatch, WorkflowOptions, WorkflowRegistry};
use waypoint_types::workflow::{CallRequest, FailureContext};

/// The registry served by `wpt serve`.
pub fn registry() -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();

    registry.register("onboarding", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            let email = ctx.payload()["email"].as_str().unwrap_or("unknown").to_string();

            let account_id: String = ctx
                .run("create-account", || {
                    let email = email.clone();
                    async move {
                        tracing::info!(%email, "creating account");
                        anyhow::Ok(format!("acct_{}", email.len()))
                    }
                })
                .await?;

            ctx.sleep("welcome-delay", Duration::from_secs(5)).await?;

            let verification = ctx
                .wait_for_event(
                    "email-verified",
                    &format!("verify:{email}"),
                    Some(Duration::from_secs(24 * 60 * 60)),
                )
                .await?;

            let outcome: String = if verification.timeout {
                ctx.run("send-reminder", || async { anyhow::Ok("reminded".to_string()) })
                    .await?
            } else {
                ctx.run("activate", || async { anyhow::Ok("active".to_string()) })
                    .await?
            };

            Ok(json!({
                "accountId": account_id,
                "status": outcome,
                "verification": verification.event_data,
            }))
        })
    });

    registry.register("fan-out", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            let numbers: Vec<i64> = ctx.payload_as::<Vec<i64>>().unwrap_or_else(|_| vec![1, 2, 3]);

            let mut batch = ParallelBatch::new("square");
            for (i, n) in numbers.iter().copied().enumerate() {
                batch = batch.run(format!("square-{i}"), move || async move { anyhow::Ok(n * n) });
            }
            let squares = ctx.parallel(batch).await?;

            let total: i64 = ctx
                .run("sum", || {
                    let squares = squares.clone();
                    async move { anyhow::Ok(squares.iter().filter_map(Value::as_i64).sum::<i64>()) }
                })
                .await?;

            Ok(json!({ "squares": squares, "total": total }))
        })
    });

    registry.register(
        "fetch",
        WorkflowOptions::new().retries(1),
        |ctx| {
            Box::pin(async move {
                let url = ctx.payload()["url"]
                    .as_str()
                    .unwrap_or("https://example.com")
                    .to_string();
                let response = ctx.call("get", CallRequest::new(url).method("GET")).await?;
                Ok(json!({ "status": response.status, "bytes": response.body.len() }))
            })
        },
    );

    registry.register(
        "flaky",
        WorkflowOptions::new().retries(2).failure_function(ReportFailure),
        |ctx| {
            Box::pin(async move {
                let _: Value = ctx
                    .run("always-fails", || async {
                        Err::<Value, _>(anyhow::anyhow!("upstream unavailable"))
                    })
                    .await?;
                Ok(Value::Null)
            })
        },
    );

    registry
}

/// Logs the failed run and records a short summary as its failure response.
struct ReportFailure;

impl FailureFunction for ReportFailure {
    fn on_failure<'a>(&'a self, failure: &'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>> {
        Box::pin(async move {
            tracing::warn!(
                run_id = %failure.run_id,
                status = failure.status,
                step = ?failure.failed_step,
                "workflow run failed"
            );
            Ok(Some(json!({ "reported": true, "reason": failure.body })))
        })
    }
}
