//! Event bus for workflow lifecycle events.
//!
//! `EventBus` distributes `WorkflowEvent`s to every subscriber via a
//! `tokio::sync::broadcast` channel for in-process observers.

pub mod bus;

pub use bus::EventBus;
