//! Retry handler for failing RUN steps.
//!
//! Stateless: all logic is in associated functions that take the retry
//! budget and backoff configuration as parameters. Attempts are 1-based, and
//! a step with `retries = n` runs at most `n + 1` times.

use std::time::Duration;

use waypoint_types::config::BackoffConfig;

// ---------------------------------------------------------------------------
// RetryAction
// ---------------------------------------------------------------------------

/// What to do after a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// Retries are exhausted; the step fails terminally.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(retries: u32, attempt: u32) -> bool {
        attempt <= retries
    }

    /// Exponential backoff: `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn backoff(config: &BackoffConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let delay_ms = config.base_delay_ms.saturating_mul(factor);
        let max_ms = config.max_delay_secs.saturating_mul(1_000);
        Duration::from_millis(delay_ms.min(max_ms))
    }

    pub fn decide(retries: u32, config: &BackoffConfig, attempt: u32) -> RetryAction {
        if Self::should_retry(retries, attempt) {
            RetryAction::Retry {
                delay: Self::backoff(config, attempt),
            }
        } else {
            RetryAction::GiveUp
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
