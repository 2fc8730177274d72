//! Shared domain types for Waypoint.
//!
//! This crate contains the core domain types used across the Waypoint durable
//! workflow engine: runs, step records, waiters, wire envelopes, scheduler
//! messages, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, base64.

pub mod config;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod workflow;
