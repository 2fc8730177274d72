//! End-to-end engine tests against the in-memory repository and scheduler.
//!
//! The harness delivers queued messages by hand, ignoring their delays, so
//! tests control every interleaving: duplicate deliveries, out-of-order
//! branch completion and notify/timeout races.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use waypoint_types::config::{BackoffConfig, EngineConfig};
use waypoint_types::envelope::{HEADER_INIT, HEADER_RUN_ID, InboundRequest, init_token};
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    CallRequest, CallResponse, FailureContext, RunId, StepDetail, StepKey, StepRecord,
    StepStatus, WaitEventResult, WorkflowRun, WorkflowRunStatus,
};

use crate::repository::memory::InMemoryWorkflowRepository;
use crate::repository::workflow::WorkflowRepository;
use crate::scheduler::memory::{InMemoryScheduler, ScheduledMessage};

use super::context::ParallelBatch;
use super::engine::{InvocationOutcome, WorkflowEngine};
use super::error::{EngineError, WorkflowError};
use super::ledger::derive_token;
use super::registry::{WorkflowOptions, WorkflowRegistry};

const BASE: &str = "http://localhost:8340";

type Engine = WorkflowEngine<InMemoryWorkflowRepository, InMemoryScheduler>;

struct Harness {
    engine: Engine,
    repo: Arc<InMemoryWorkflowRepository>,
    scheduler: Arc<InMemoryScheduler>,
    /// Messages addressed outside the workflow endpoints (failure URLs).
    external: Mutex<Vec<ScheduledMessage>>,
}

impl Harness {
    fn new(registry: WorkflowRegistry) -> Self {
        let mut config = EngineConfig::default();
        config.base_url = Some(BASE.to_string());
        config.retry = BackoffConfig {
            base_delay_ms: 10,
            max_delay_secs: 1,
        };
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let scheduler = Arc::new(InMemoryScheduler::new());
        let engine = WorkflowEngine::new(Arc::clone(&repo), Arc::clone(&scheduler), registry, config);
        Self {
            engine,
            repo,
            scheduler,
            external: Mutex::new(Vec::new()),
        }
    }

    async fn trigger(&self, name: &str, payload: Value, run_id: &str) -> Result<InvocationOutcome, EngineError> {
        let request = InboundRequest::new(
            format!("{BASE}/workflows/{name}"),
            serde_json::to_vec(&payload).unwrap(),
        )
        .with_header(HEADER_INIT, "true")
        .with_header(HEADER_RUN_ID, run_id);
        self.engine.handle(name, request).await
    }

    async fn deliver(&self, message: &ScheduledMessage) -> Result<InvocationOutcome, EngineError> {
        let inbound = message.to_inbound();
        let name = endpoint_name(&inbound.url);
        self.engine.handle(&name, inbound).await
    }

    async fn answer(
        &self,
        message: &ScheduledMessage,
        status: u16,
        body: &str,
        failure: bool,
    ) -> Result<InvocationOutcome, EngineError> {
        let inbound = message
            .callback_request(status, Default::default(), body.as_bytes(), failure)
            .expect("call message has callbacks");
        let name = endpoint_name(&inbound.url);
        self.engine.handle(&name, inbound).await
    }

    /// Deliver everything queued until nothing is left, answering CALLs
    /// with `200 {}`.
    async fn drain(&self) -> Vec<InvocationOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..64 {
            let batch = self.scheduler.take_all();
            if batch.is_empty() {
                break;
            }
            for message in batch {
                if message.is_call() {
                    outcomes.push(self.answer(&message, 200, "{}", false).await.unwrap());
                } else if message.request.destination.starts_with(BASE) {
                    outcomes.push(self.deliver(&message).await.unwrap());
                } else {
                    self.external.lock().unwrap().push(message);
                }
            }
        }
        outcomes
    }

    async fn run(&self, run_id: &str) -> WorkflowRun {
        self.engine
            .get_run(&RunId(run_id.to_string()))
            .await
            .unwrap()
            .expect("run exists")
    }
}

fn endpoint_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn failure_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>> + Send + Sync,
{
    f
}

/// Failure function recording every context it receives.
fn recording_failure_fn(
    seen: Arc<Mutex<Vec<FailureContext>>>,
) -> impl for<'a> Fn(&'a FailureContext) -> BoxFuture<'a, anyhow::Result<Option<Value>>> + Send + Sync {
    failure_fn(move |failure| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            seen.lock().unwrap().push(failure.clone());
            anyhow::Ok(Some(json!({ "handled": failure.status })))
        })
    })
}

// ---------------------------------------------------------------------------
// Replay and memoization
// ---------------------------------------------------------------------------

fn three_step_registry(first: Arc<AtomicUsize>, second: Arc<AtomicUsize>) -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();
    registry.register("onboard", WorkflowOptions::new(), move |ctx| {
        let first = Arc::clone(&first);
        let second = Arc::clone(&second);
        Box::pin(async move {
            let user: String = ctx.payload()["user"].as_str().unwrap_or_default().to_string();
            let greeting: String = ctx
                .run("greet", || async move {
                    first.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(format!("hello {user}"))
                })
                .await?;
            ctx.sleep("cool-down", Duration::from_secs(3600)).await?;
            let length: usize = ctx
                .run("measure", || {
                    let greeting = greeting.clone();
                    async move {
                        second.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(greeting.len())
                    }
                })
                .await?;
            Ok(json!({ "greeting": greeting, "length": length }))
        })
    });
    registry
}

#[tokio::test]
async fn three_step_run_takes_two_invocations() {
    let (first, second) = (counter(), counter());
    let harness = Harness::new(three_step_registry(Arc::clone(&first), Arc::clone(&second)));

    let outcome = harness.trigger("onboard", json!({"user": "ada"}), "wfr_three").await.unwrap();
    assert_eq!(
        outcome,
        InvocationOutcome::Suspended {
            run_id: RunId("wfr_three".to_string())
        }
    );
    assert_eq!(harness.run("wfr_three").await.status, WorkflowRunStatus::Waiting);

    let outcomes = harness.drain().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0],
        InvocationOutcome::Completed {
            run_id: RunId("wfr_three".to_string()),
            result: json!({"greeting": "hello ada", "length": 9}),
        }
    );

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    let run = harness.run("wfr_three").await;
    assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn reused_step_names_in_a_loop_get_one_record_per_iteration() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let registry = WorkflowRegistry::new();
    let body_log = Arc::clone(&executed);
    registry.register("batch-charge", WorkflowOptions::new(), move |ctx| {
        let log = Arc::clone(&body_log);
        Box::pin(async move {
            let mut charged = Vec::new();
            for i in 0..3u32 {
                let log = Arc::clone(&log);
                let amount: u32 = ctx
                    .run("charge", || async move {
                        log.lock().unwrap().push(i);
                        anyhow::Ok(i * 10)
                    })
                    .await?;
                charged.push(amount);
                ctx.sleep("nap", Duration::from_secs(60)).await?;
            }
            Ok(json!(charged))
        })
    });
    let harness = Harness::new(registry);

    let outcome = harness.trigger("batch-charge", Value::Null, "wfr_loop").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Suspended { .. }));
    let outcomes = harness.drain().await;

    // One wake-up per nap; only the last one completes the run.
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(&outcomes[..2], [InvocationOutcome::Suspended { .. }, InvocationOutcome::Suspended { .. }]));
    assert_eq!(
        outcomes[2],
        InvocationOutcome::Completed {
            run_id: RunId("wfr_loop".to_string()),
            result: json!([0, 10, 20]),
        }
    );
    assert_eq!(*executed.lock().unwrap(), vec![0, 1, 2]);

    let ledger = harness.engine.ledger(&RunId("wfr_loop".to_string())).await.unwrap();
    let keys: Vec<String> = ledger.steps.iter().map(|s| s.key.to_string()).collect();
    assert_eq!(keys, vec!["charge#0", "nap#0", "charge#1", "nap#1", "charge#2", "nap#2"]);
    assert!(ledger.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(ledger.steps[4].result, Some(json!(20)));
}

#[tokio::test]
async fn duplicate_message_is_dropped_and_redelivery_replays_without_rerunning() {
    let (first, second) = (counter(), counter());
    let harness = Harness::new(three_step_registry(Arc::clone(&first), Arc::clone(&second)));
    harness.trigger("onboard", json!({"user": "bob"}), "wfr_dup").await.unwrap();

    let wake = harness.scheduler.take_all().remove(0);
    harness.deliver(&wake).await.unwrap();
    let again = harness.deliver(&wake).await.unwrap();
    assert_eq!(
        again,
        InvocationOutcome::Ignored {
            run_id: None,
            reason: "duplicate message"
        }
    );

    // Same envelope under a new message id: the run is settled, nothing reruns.
    let mut redelivered = wake.clone();
    redelivered.message_id = "msg_redelivered".to_string();
    let outcome = harness.deliver(&redelivered).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Ignored { reason: "run is settled", .. }));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redelivered_trigger_replays_live_run_and_ignores_settled_one() {
    let (first, second) = (counter(), counter());
    let harness = Harness::new(three_step_registry(Arc::clone(&first), Arc::clone(&second)));

    harness.trigger("onboard", json!({"user": "cy"}), "wfr_start").await.unwrap();
    let outcome = harness.trigger("onboard", json!({"user": "cy"}), "wfr_start").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Suspended { .. }));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    // The republished wake-up collapses onto the first one.
    assert_eq!(harness.scheduler.len(), 1);

    harness.drain().await;
    let outcome = harness.trigger("onboard", json!({"user": "cy"}), "wfr_start").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Ignored { reason: "run already exists", .. }));
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn swallowed_suspension_still_suspends_the_run() {
    let registry = WorkflowRegistry::new();
    registry.register("careless", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            let _ = ctx.sleep("ignored", Duration::from_secs(60)).await;
            Ok(json!("done too early"))
        })
    });
    let harness = Harness::new(registry);

    let outcome = harness.trigger("careless", Value::Null, "wfr_swallow").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Suspended { .. }));
    assert_eq!(harness.run("wfr_swallow").await.status, WorkflowRunStatus::Waiting);
}

#[tokio::test]
async fn unknown_workflow_and_malformed_envelope_are_rejected() {
    let harness = Harness::new(three_step_registry(counter(), counter()));

    let err = harness.trigger("missing", Value::Null, "wfr_x").await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));

    let request = InboundRequest::new(format!("{BASE}/workflows/onboard"), b"not an envelope".to_vec())
        .with_header(HEADER_INIT, "false")
        .with_header(HEADER_RUN_ID, "wfr_x");
    let err = harness.engine.handle("onboard", request).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedEnvelope(_)));
}

// ---------------------------------------------------------------------------
// Parallel batches
// ---------------------------------------------------------------------------

fn fan_out_registry(runs: Arc<[AtomicUsize; 3]>) -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();
    registry.register("fan", WorkflowOptions::new(), move |ctx| {
        let runs = Arc::clone(&runs);
        Box::pin(async move {
            let batch = ParallelBatch::new("lookups")
                .run("a", {
                    let runs = Arc::clone(&runs);
                    move || async move {
                        runs[0].fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok("A")
                    }
                })
                .run("b", {
                    let runs = Arc::clone(&runs);
                    move || async move {
                        runs[1].fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok("B")
                    }
                })
                .run("c", {
                    let runs = Arc::clone(&runs);
                    move || async move {
                        runs[2].fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok("C")
                    }
                });
            let results = ctx.parallel(batch).await?;
            Ok(Value::Array(results))
        })
    });
    registry
}

#[tokio::test]
async fn parallel_branches_join_once_for_every_arrival_order() {
    const ORDERS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    for (i, order) in ORDERS.iter().enumerate() {
        let runs = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
        let harness = Harness::new(fan_out_registry(Arc::clone(&runs)));
        let run_id = format!("wfr_fan_{i}");

        let outcome = harness.trigger("fan", Value::Null, &run_id).await.unwrap();
        assert!(matches!(outcome, InvocationOutcome::Suspended { .. }));
        let branches = harness.scheduler.take_all();
        assert_eq!(branches.len(), 3);

        let mut outcomes = Vec::new();
        for &index in order {
            outcomes.push(harness.deliver(&branches[index]).await.unwrap());
        }

        let completed: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, InvocationOutcome::Completed { .. }))
            .collect();
        assert_eq!(completed.len(), 1, "order {order:?}");
        assert!(matches!(
            outcomes.last(),
            Some(InvocationOutcome::Completed { result, .. }) if *result == json!(["A", "B", "C"])
        ));
        for member in runs.iter() {
            assert_eq!(member.load(Ordering::SeqCst), 1, "order {order:?}");
        }
        assert!(harness.scheduler.is_empty());
    }
}

#[tokio::test]
async fn concurrent_branches_settle_the_run_once() {
    let runs = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
    let harness = Harness::new(fan_out_registry(Arc::clone(&runs)));
    let mut events = harness.engine.event_bus().subscribe();

    harness.trigger("fan", Value::Null, "wfr_concurrent").await.unwrap();
    let branches = harness.scheduler.take_all();
    let outcomes = join_all(branches.iter().map(|m| harness.deliver(m))).await;
    assert!(outcomes.iter().all(Result::is_ok));

    let run = harness.run("wfr_concurrent").await;
    assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    assert_eq!(run.result, Some(json!(["A", "B", "C"])));
    for member in runs.iter() {
        assert_eq!(member.load(Ordering::SeqCst), 1);
    }

    let mut succeeded = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkflowEvent::RunSucceeded { .. }) {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn failed_member_fails_the_batch_after_all_members_settle() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = WorkflowRegistry::new();
    registry.register(
        "mixed",
        WorkflowOptions::new()
            .retries(0)
            .failure_function(recording_failure_fn(Arc::clone(&seen))),
        |ctx| {
            Box::pin(async move {
                let batch = ParallelBatch::new("mixed")
                    .run("ok", || async { anyhow::Ok(1) })
                    .run("broken", || async { Err::<i32, _>(anyhow::anyhow!("disk full")) })
                    .run("also-broken", || async { Err::<i32, _>(anyhow::anyhow!("timeout")) });
                let results = ctx.parallel(batch).await?;
                Ok(Value::Array(results))
            })
        },
    );
    let harness = Harness::new(registry);

    harness.trigger("mixed", Value::Null, "wfr_mixed").await.unwrap();
    let branches = harness.scheduler.take_all();
    // Deliver the later failure first; the first failure by position wins.
    let outcomes = vec![
        harness.deliver(&branches[2]).await.unwrap(),
        harness.deliver(&branches[0]).await.unwrap(),
        harness.deliver(&branches[1]).await.unwrap(),
    ];
    assert!(matches!(outcomes[0], InvocationOutcome::Suspended { .. }));
    assert!(matches!(outcomes[1], InvocationOutcome::Suspended { .. }));
    assert!(matches!(outcomes[2], InvocationOutcome::Failed { .. }));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].failed_step, Some(StepKey::new("broken", 0)));
    assert_eq!(seen[0].body, "disk full");
}

// ---------------------------------------------------------------------------
// Retries and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_run_body_four_times_and_failure_handler_once() {
    let attempts = counter();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = WorkflowRegistry::new();
    let body_attempts = Arc::clone(&attempts);
    registry.register(
        "flaky",
        WorkflowOptions::new()
            .retries(3)
            .failure_function(recording_failure_fn(Arc::clone(&seen))),
        move |ctx| {
            let attempts = Arc::clone(&body_attempts);
            Box::pin(async move {
                ctx.run("charge", || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("card declined"))
                })
                .await?;
                Ok(Value::Null)
            })
        },
    );
    let harness = Harness::new(registry);

    let outcome = harness.trigger("flaky", Value::Null, "wfr_flaky").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Suspended { .. }));
    let outcomes = harness.drain().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(matches!(outcomes.last(), Some(InvocationOutcome::Failed { .. })));
    assert_eq!(seen.lock().unwrap().len(), 1);

    let run = harness.run("wfr_flaky").await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.failure_response, Some(json!({"handled": 500})));
    let failure = run.failure.unwrap();
    assert_eq!(failure.body, "card declined");
    assert_eq!(failure.failed_step, Some(StepKey::new("charge", 0)));

    let ledger = harness.engine.ledger(&RunId("wfr_flaky".to_string())).await.unwrap();
    assert_eq!(ledger.steps[0].status, StepStatus::Failed);
    assert_eq!(ledger.steps[0].attempts, 4);
}

#[tokio::test]
async fn step_succeeds_on_retry() {
    let attempts = counter();
    let registry = WorkflowRegistry::new();
    let body_attempts = Arc::clone(&attempts);
    registry.register("eventually", WorkflowOptions::new().retries(2), move |ctx| {
        let attempts = Arc::clone(&body_attempts);
        Box::pin(async move {
            let value: u32 = ctx
                .run("fetch", || async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("connection reset");
                    }
                    anyhow::Ok(42)
                })
                .await?;
            Ok(json!(value))
        })
    });
    let harness = Harness::new(registry);

    harness.trigger("eventually", Value::Null, "wfr_retry").await.unwrap();
    let retry = harness.scheduler.pending();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].request.deduplication_id.as_deref().map(|d| d.ends_with(":retry")), Some(true));

    let outcomes = harness.drain().await;
    assert!(matches!(&outcomes[..], [InvocationOutcome::Completed { result, .. }] if *result == json!(42)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failure_url_receives_failure_context() {
    let registry = WorkflowRegistry::new();
    registry.register(
        "strict",
        WorkflowOptions::new().failure_url("https://hooks.example.com/failed"),
        |ctx| {
            Box::pin(async move {
                if ctx.payload().get("amount").is_none() {
                    return Err(WorkflowError::User("amount is required".to_string()));
                }
                Ok(Value::Null)
            })
        },
    );
    let harness = Harness::new(registry);

    let outcome = harness.trigger("strict", json!({}), "wfr_strict").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed { .. }));

    harness.drain().await;
    let external = harness.external.lock().unwrap();
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].request.destination, "https://hooks.example.com/failed");
    let context: FailureContext = serde_json::from_slice(&external[0].request.body).unwrap();
    assert_eq!(context.status, 500);
    assert_eq!(context.body, "amount is required");
    assert_eq!(context.workflow_url, format!("{BASE}/workflows/strict"));

    let run = harness.run("wfr_strict").await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(
        run.failure_response.unwrap()["messageId"],
        json!(external[0].message_id)
    );
}

#[tokio::test]
async fn failure_function_error_keeps_run_pending_until_redelivery() {
    let calls = counter();
    let registry = WorkflowRegistry::new();
    let handler_calls = Arc::clone(&calls);
    registry.register(
        "fragile",
        WorkflowOptions::new().failure_function(failure_fn(move |_failure| {
            let calls = Arc::clone(&handler_calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("alerting service down");
                }
                anyhow::Ok(None)
            })
        })),
        |_ctx| Box::pin(async move { Err(WorkflowError::User("boom".to_string())) }),
    );
    let harness = Harness::new(registry);

    let err = harness.trigger("fragile", Value::Null, "wfr_fragile").await.unwrap_err();
    assert!(matches!(err, EngineError::FailureCallback(_)));
    assert_eq!(
        harness.run("wfr_fragile").await.status,
        WorkflowRunStatus::FailedPendingCallback
    );

    let outcome = harness.trigger("fragile", Value::Null, "wfr_fragile").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.run("wfr_fragile").await.status, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn concurrent_duplicate_triggers_run_the_failure_function_once() {
    let calls = counter();
    let registry = WorkflowRegistry::new();
    let handler_calls = Arc::clone(&calls);
    registry.register(
        "declined",
        WorkflowOptions::new().retries(0).failure_function(failure_fn(move |_failure| {
            let calls = Arc::clone(&handler_calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                anyhow::Ok(Some(json!({ "alerted": true })))
            })
        })),
        |ctx| {
            Box::pin(async move {
                ctx.run("charge", || async { Err::<(), _>(anyhow::anyhow!("card declined")) })
                    .await?;
                Ok(Value::Null)
            })
        },
    );
    let harness = Harness::new(registry);

    let (a, b) = tokio::join!(
        harness.trigger("declined", Value::Null, "wfr_declined"),
        harness.trigger("declined", Value::Null, "wfr_declined"),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let failed = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Ok(InvocationOutcome::Failed { .. })))
        .count();
    assert_eq!(failed, 1, "outcomes: {a:?} / {b:?}");
    let run = harness.run("wfr_declined").await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.failure_response, Some(json!({ "alerted": true })));

    // A later redelivery finds the failure handled.
    let outcome = harness.trigger("declined", Value::Null, "wfr_declined").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Ignored { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_handler_lease_blocks_a_second_handler_while_held() {
    let calls = counter();
    let registry = WorkflowRegistry::new();
    let handler_calls = Arc::clone(&calls);
    registry.register(
        "guarded",
        WorkflowOptions::new().failure_function(failure_fn(move |_failure| {
            let calls = Arc::clone(&handler_calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(None)
            })
        })),
        |_ctx| Box::pin(async move { Err(WorkflowError::User("boom".to_string())) }),
    );
    let harness = Harness::new(registry);
    let run_id = RunId("wfr_guarded".to_string());
    harness
        .repo
        .create_run(&WorkflowRun::new(run_id.clone(), "guarded", format!("{BASE}/workflows/guarded"), Vec::new()))
        .await
        .unwrap();
    harness
        .repo
        .transition_run(
            &run_id,
            &WorkflowRunStatus::LIVE,
            WorkflowRunStatus::FailedPendingCallback,
            waypoint_types::workflow::RunPatch::none(),
        )
        .await
        .unwrap();
    // Another invocation is running the handler.
    let until = chrono::Utc::now() + chrono::Duration::minutes(5);
    assert!(harness.repo.claim_failure_handler(&run_id, until).await.unwrap());

    let err = harness.trigger("guarded", Value::Null, "wfr_guarded").await.unwrap_err();
    assert!(matches!(err, EngineError::FailureHandlerBusy(id) if id == run_id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Its holder gave up: the redelivery runs the handler.
    harness.repo.release_failure_handler(&run_id).await.unwrap();
    let outcome = harness.trigger("guarded", Value::Null, "wfr_guarded").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn changed_step_kind_fails_the_run() {
    let first_replay = Arc::new(AtomicBool::new(true));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = WorkflowRegistry::new();
    registry.register(
        "shifty",
        WorkflowOptions::new().failure_function(recording_failure_fn(Arc::clone(&seen))),
        move |ctx| {
            let first_replay = Arc::clone(&first_replay);
            Box::pin(async move {
                if first_replay.swap(false, Ordering::SeqCst) {
                    ctx.run("step", || async { anyhow::Ok(1) }).await?;
                } else {
                    ctx.sleep("step", Duration::from_secs(1)).await?;
                }
                ctx.sleep("nap", Duration::from_secs(1)).await?;
                Ok(Value::Null)
            })
        },
    );
    let harness = Harness::new(registry);

    harness.trigger("shifty", Value::Null, "wfr_shifty").await.unwrap();
    let outcomes = harness.drain().await;
    assert!(matches!(outcomes[..], [InvocationOutcome::Failed { .. }]));
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].failed_step, Some(StepKey::new("step", 0)));
    assert!(seen[0].body.contains("ledger mismatch"));
}

#[tokio::test]
async fn live_lease_makes_invocation_busy() {
    let harness = Harness::new(three_step_registry(counter(), counter()));
    let run_id = RunId("wfr_busy".to_string());
    let run = WorkflowRun::new(run_id.clone(), "onboard", format!("{BASE}/workflows/onboard"), b"{}".to_vec());
    harness.repo.create_run(&run).await.unwrap();

    let key = StepKey::new("greet", 0);
    let owner = derive_token(&init_token(&run_id), &key);
    let record = StepRecord::pending(run_id.clone(), key.clone(), StepDetail::Run, owner.clone());
    harness.repo.insert_step(&record).await.unwrap();
    let lease_until = chrono::Utc::now() + chrono::Duration::minutes(5);
    harness
        .repo
        .begin_attempt(&run_id, &key, &owner, lease_until)
        .await
        .unwrap();

    let err = harness.trigger("onboard", json!({}), "wfr_busy").await.unwrap_err();
    assert!(matches!(err, EngineError::Busy { step, .. } if step == key));
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

fn call_registry(seen: Arc<Mutex<Vec<FailureContext>>>) -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();
    registry.register(
        "billing",
        WorkflowOptions::new().failure_function(recording_failure_fn(seen)),
        |ctx| {
            Box::pin(async move {
                let response: CallResponse = ctx
                    .call(
                        "charge",
                        CallRequest::new("https://payments.example.com/charge")
                            .json(&json!({"amount": 1200}))
                            .retries(2),
                    )
                    .await?;
                Ok(json!({ "status": response.status, "body": response.body }))
            })
        },
    );
    registry
}

#[tokio::test]
async fn call_response_is_memoized() {
    let harness = Harness::new(call_registry(Arc::new(Mutex::new(Vec::new()))));
    harness.trigger("billing", Value::Null, "wfr_call").await.unwrap();

    let call = harness.scheduler.take_all().remove(0);
    assert!(call.is_call());
    assert_eq!(call.request.destination, "https://payments.example.com/charge");
    assert_eq!(call.request.retries, 2);

    let outcome = harness.answer(&call, 201, r#"{"id":"ch_1"}"#, false).await.unwrap();
    assert_eq!(
        outcome,
        InvocationOutcome::Completed {
            run_id: RunId("wfr_call".to_string()),
            result: json!({"status": 201, "body": "{\"id\":\"ch_1\"}"}),
        }
    );
}

#[tokio::test]
async fn non_success_call_fails_the_run_with_response_details() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let harness = Harness::new(call_registry(Arc::clone(&seen)));
    harness.trigger("billing", Value::Null, "wfr_declined").await.unwrap();

    let call = harness.scheduler.take_all().remove(0);
    let outcome = harness.answer(&call, 402, "insufficient funds", true).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed { .. }));

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].status, 402);
    assert_eq!(seen[0].body, "insufficient funds");
    assert_eq!(seen[0].failed_step, Some(StepKey::new("charge", 0)));
}

// ---------------------------------------------------------------------------
// Waiting for events
// ---------------------------------------------------------------------------

fn approval_registry() -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();
    registry.register("approval", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            let result = ctx
                .wait_for_event("await-approval", "approve-42", Some(Duration::from_secs(600)))
                .await?;
            Ok(serde_json::to_value(result)?)
        })
    });
    registry.register("approver", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            let notified = ctx
                .notify("approve", "approve-42", json!({"approved": true}))
                .await?;
            Ok(json!(notified.len()))
        })
    });
    registry
}

#[tokio::test]
async fn notify_resumes_waiting_run() {
    let harness = Harness::new(approval_registry());
    harness.trigger("approval", Value::Null, "wfr_wait").await.unwrap();
    let timeout = harness.scheduler.take_all().remove(0);

    let results = harness
        .engine
        .notify("approve-42", json!({"approved": true}))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].message_id.is_some());

    let outcomes = harness.drain().await;
    let expected = serde_json::to_value(WaitEventResult {
        event_data: Some(json!({"approved": true})),
        timeout: false,
    })
    .unwrap();
    assert!(matches!(&outcomes[..], [InvocationOutcome::Completed { result, .. }] if *result == expected));

    // The timeout arriving afterwards changes nothing.
    let late = harness.deliver(&timeout).await.unwrap();
    assert!(matches!(late, InvocationOutcome::Ignored { .. }));

    // A second notify finds no waiter.
    assert!(harness.engine.notify("approve-42", json!(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_before_notify_reports_timeout() {
    let harness = Harness::new(approval_registry());
    harness.trigger("approval", Value::Null, "wfr_timeout").await.unwrap();

    let outcomes = harness.drain().await;
    let expected = serde_json::to_value(WaitEventResult {
        event_data: None,
        timeout: true,
    })
    .unwrap();
    assert!(matches!(&outcomes[..], [InvocationOutcome::Completed { result, .. }] if *result == expected));
    assert!(harness.engine.notify("approve-42", json!(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_notify_and_timeout_agree() {
    let harness = Harness::new(approval_registry());
    harness.trigger("approval", Value::Null, "wfr_race").await.unwrap();
    let timeout = harness.scheduler.take_all().remove(0);

    let (notified, timed_out) = tokio::join!(
        harness.engine.notify("approve-42", json!({"approved": true})),
        harness.deliver(&timeout),
    );
    let notified = notified.unwrap();
    timed_out.unwrap();
    harness.drain().await;

    let run = harness.run("wfr_race").await;
    assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    let result: WaitEventResult = serde_json::from_value(run.result.unwrap()).unwrap();
    if notified.is_empty() {
        assert!(result.timeout);
        assert_eq!(result.event_data, None);
    } else {
        assert!(!result.timeout);
        assert_eq!(result.event_data, Some(json!({"approved": true})));
    }
}

#[tokio::test]
async fn notify_step_reports_matched_waiters() {
    let harness = Harness::new(approval_registry());
    harness.trigger("approval", Value::Null, "wfr_waiting").await.unwrap();

    let outcome = harness.trigger("approver", Value::Null, "wfr_approver").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Completed { result, .. } if result == json!(1)));

    harness.drain().await;
    assert_eq!(harness.run("wfr_waiting").await.status, WorkflowRunStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Cancellation and retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_drops_scheduled_work_and_ignores_stale_deliveries() {
    let (first, second) = (counter(), counter());
    let harness = Harness::new(three_step_registry(Arc::clone(&first), Arc::clone(&second)));
    harness.trigger("onboard", json!({"user": "dee"}), "wfr_cancel").await.unwrap();
    let wake = harness.scheduler.pending().remove(0);

    let run_id = RunId("wfr_cancel".to_string());
    assert!(harness.engine.cancel(&run_id).await.unwrap());
    assert!(!harness.engine.cancel(&run_id).await.unwrap());
    assert!(harness.scheduler.is_empty());
    assert_eq!(harness.run("wfr_cancel").await.status, WorkflowRunStatus::Canceled);

    let stale = harness.deliver(&wake).await.unwrap();
    assert!(matches!(stale, InvocationOutcome::Ignored { .. }));
    assert_eq!(second.load(Ordering::SeqCst), 0);

    let missing = harness.engine.cancel(&RunId("wfr_nope".to_string())).await.unwrap_err();
    assert!(matches!(missing, EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn workflow_can_cancel_itself() {
    let registry = WorkflowRegistry::new();
    registry.register("quitter", WorkflowOptions::new(), |ctx| {
        Box::pin(async move {
            if ctx.payload()["stop"] == json!(true) {
                ctx.cancel().await?;
            }
            Ok(json!("kept going"))
        })
    });
    let harness = Harness::new(registry);

    let outcome = harness.trigger("quitter", json!({"stop": true}), "wfr_quit").await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Canceled { .. }));
    assert_eq!(harness.run("wfr_quit").await.status, WorkflowRunStatus::Canceled);
}

#[tokio::test]
async fn purge_removes_only_settled_runs() {
    let harness = Harness::new(three_step_registry(counter(), counter()));
    harness.trigger("onboard", json!({"user": "eve"}), "wfr_done").await.unwrap();
    harness.drain().await;
    harness.trigger("onboard", json!({"user": "fay"}), "wfr_live").await.unwrap();

    // Zero-day retention purges everything settled before now.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(harness.engine.purge(0).await.unwrap(), 1);
    assert!(harness.engine.get_run(&RunId("wfr_done".to_string())).await.unwrap().is_none());
    assert!(harness.engine.get_run(&RunId("wfr_live".to_string())).await.unwrap().is_some());
}
