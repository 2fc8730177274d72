use thiserror::Error;

use crate::workflow::RunId;

/// Errors from repository operations (used by trait definitions in waypoint-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors returned by a durable scheduler backend.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler could not be reached.
    #[error("scheduler unreachable: {0}")]
    Unreachable(String),

    /// The scheduler answered with a non-success status.
    #[error("scheduler rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The scheduler response could not be decoded.
    #[error("invalid scheduler response: {0}")]
    InvalidResponse(String),

    /// The publish request itself was invalid (bad destination, delay, ...).
    #[error("invalid publish request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Unreachable(_) => true,
            SchedulerError::Rejected { status, .. } => *status == 429 || *status >= 500,
            SchedulerError::InvalidResponse(_) | SchedulerError::InvalidRequest(_) => false,
        }
    }
}

/// Errors raised while decoding an inbound workflow invocation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid header {header}: {reason}")]
    InvalidHeader { header: &'static str, reason: String },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("malformed envelope: {0}")]
    InvalidBody(String),

    #[error("run id mismatch: header {header}, body {body}")]
    RunIdMismatch { header: RunId, body: RunId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::Rejected {
            status: 412,
            message: "destination not allowed".to_string(),
        };
        assert!(err.to_string().contains("412"));
        assert!(err.to_string().contains("destination not allowed"));
    }

    #[test]
    fn test_scheduler_error_transient() {
        assert!(SchedulerError::Unreachable("dns".to_string()).is_transient());
        assert!(
            SchedulerError::Rejected {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            SchedulerError::Rejected {
                status: 429,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !SchedulerError::Rejected {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!SchedulerError::InvalidRequest("no url".to_string()).is_transient());
    }
}
