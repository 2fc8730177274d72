//! Observability setup for Waypoint: tracing subscriber and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
