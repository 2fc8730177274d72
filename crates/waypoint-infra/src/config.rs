//! Configuration loader for Waypoint.
//!
//! Reads `config.toml` from the data directory (`~/.waypoint/` unless
//! `WAYPOINT_DATA_DIR` is set) and deserializes it into [`EngineConfig`].
//! Falls back to defaults when the file is missing or malformed, then applies
//! environment overrides for secrets that should not live in the file.

use std::path::{Path, PathBuf};

use waypoint_types::config::{EngineConfig, SchedulerKind};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WAYPOINT_DATA_DIR";

const SCHEDULER_URL_ENV: &str = "WAYPOINT_SCHEDULER_URL";
const SCHEDULER_TOKEN_ENV: &str = "WAYPOINT_SCHEDULER_TOKEN";
const CURRENT_SIGNING_KEY_ENV: &str = "WAYPOINT_CURRENT_SIGNING_KEY";
const NEXT_SIGNING_KEY_ENV: &str = "WAYPOINT_NEXT_SIGNING_KEY";

/// The data directory: `WAYPOINT_DATA_DIR`, or `~/.waypoint`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".waypoint")
}

/// Load configuration from `{data_dir}/config.toml` and apply environment
/// overrides.
///
/// - If the file does not exist, starts from [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and starts from the default.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let mut config = read_config_file(data_dir).await;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config
}

async fn read_config_file(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Overlay scheduler and signing settings from the environment.
///
/// Setting `WAYPOINT_SCHEDULER_URL` also selects the HTTP scheduler.
pub fn apply_env_overrides(config: &mut EngineConfig, var: impl Fn(&str) -> Option<String>) {
    let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty(SCHEDULER_URL_ENV) {
        config.scheduler.url = Some(url);
        config.scheduler.kind = SchedulerKind::Http;
    }
    if let Some(token) = non_empty(SCHEDULER_TOKEN_ENV) {
        config.scheduler.token = Some(token);
    }
    if let Some(key) = non_empty(CURRENT_SIGNING_KEY_ENV) {
        config.signing.current_key = Some(key);
    }
    if let Some(key) = non_empty(NEXT_SIGNING_KEY_ENV) {
        config.signing.next_key = Some(key);
    }
}

/// The database URL to open: configured, or `{data_dir}/waypoint.db`.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(crate::sqlite::pool::default_database_url)
}
