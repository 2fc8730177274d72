//! Global configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! HTTP listener, persistence, signing keys, the durable scheduler backend and
//! the per-endpoint defaults applied to every registered workflow.

use serde::{Deserialize, Serialize};

/// Default number of retries for a failing RUN step.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default `waitForEvent` timeout (7 days).
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Default lease held while a step body executes (5 minutes).
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// Top-level configuration for a Waypoint deployment.
///
/// Loaded from `~/.waypoint/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// SQLite database URL (defaults to `{data_dir}/waypoint.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Public base URL used to build self-referencing workflow URLs
    /// (e.g. `https://workflows.example.com`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Days a terminal run is kept before it is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds a step-body lease stays valid.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Defaults applied to every workflow endpoint.
    #[serde(default)]
    pub defaults: EndpointDefaults,

    /// Backoff applied between RUN step retries.
    #[serde(default)]
    pub retry: BackoffConfig,

    /// Request signing keys.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Durable scheduler backend.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_listen() -> String {
    "127.0.0.1:8340".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_url: None,
            base_url: None,
            retention_days: default_retention_days(),
            lease_secs: default_lease_secs(),
            defaults: EndpointDefaults::default(),
            retry: BackoffConfig::default(),
            signing: SigningConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Per-endpoint defaults (`[defaults]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDefaults {
    /// Retries for a failing RUN step before it becomes terminal.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Log step transitions at `info` instead of `debug`.
    #[serde(default)]
    pub verbose: bool,

    /// URL receiving the failure context when a run fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_url: Option<String>,

    /// Default timeout for `waitForEvent` steps.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_wait_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT_SECS
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            verbose: false,
            failure_url: None,
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// Exponential backoff parameters (`[retry]` table).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single retry delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_secs() -> u64 {
    3_600
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// HMAC signing keys (`[signing]` table).
///
/// Two keys allow rotation: requests signed with either are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_key: Option<String>,
}

impl SigningConfig {
    /// Whether any signing key is configured.
    pub fn is_enabled(&self) -> bool {
        self.current_key.is_some() || self.next_key.is_some()
    }
}

/// Which durable scheduler implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Remote QStash-compatible REST scheduler.
    #[default]
    Http,
    /// In-process scheduler delivering over HTTP (development only).
    Local,
}

/// Durable scheduler backend (`[scheduler]` table).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,

    /// Scheduler REST base URL (required for `http`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Bearer token for the scheduler REST API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
