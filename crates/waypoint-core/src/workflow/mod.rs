//! Workflow engine core: replay, the step ledger and durable delivery.
//!
//! - `engine` -- serves invocations, merges deliveries, runs failure handling
//! - `context` -- step primitives handed to workflow functions
//! - `driver` -- object-safe seam between the context and durable state
//! - `checkpoint` -- logged, event-emitting step checkpoints
//! - `ledger` -- per-invocation ledger view and delivery token derivation
//! - `submitter` -- scheduler messages for reached steps
//! - `notify` -- waiter resolution for `notify`
//! - `retry` -- retry budget and exponential backoff for RUN steps
//! - `failure` -- failure function / failure URL routing
//! - `registry` -- registered workflow functions and endpoint options
//! - `client` -- trigger and resume runs through the scheduler

pub mod checkpoint;
pub mod client;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod failure;
pub mod ledger;
mod notify;
pub mod registry;
pub mod retry;
pub mod submitter;

#[cfg(test)]
mod simulation;

pub use client::{TriggeredRun, WorkflowClient};
pub use context::{ParallelBatch, WorkflowContext};
pub use engine::{InvocationOutcome, RunLedger, WorkflowEngine};
pub use error::{EngineError, WorkflowError};
pub use failure::FailureFunction;
pub use registry::{WorkflowFuture, WorkflowOptions, WorkflowRegistry};
