//! Request handlers, grouped by resource.

pub mod endpoint;
pub mod notify;
pub mod runs;
