//! Replay engine and port traits for Waypoint.
//!
//! This crate defines the ports the infrastructure layer implements
//! (`WorkflowRepository`, `DurableScheduler`) and the engine that replays
//! workflow functions against them. It depends only on `waypoint-types`,
//! never on `waypoint-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod scheduler;
pub mod workflow;
