//! HTTP layer for Waypoint.
//!
//! Axum server exposing the workflow endpoints the durable scheduler
//! delivers to, plus a management API at `/api/v1/` using the envelope
//! response format.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
