//! Infrastructure layer for Waypoint.
//!
//! Contains implementations of the ports defined in `waypoint-core`: the
//! SQLite workflow repository, the durable scheduler adapters (remote REST
//! and local in-process), request signing and configuration loading.

pub mod config;
pub mod scheduler;
pub mod signature;
pub mod sqlite;
