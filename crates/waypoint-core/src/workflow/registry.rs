//! Registry of workflow functions served by this process.
//!
//! Workflows are registered by name with per-endpoint options. The registry
//! is backed by a `DashMap` so registration and lookup can happen
//! concurrently from request handlers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use waypoint_types::config::{BackoffConfig, EngineConfig};

use super::context::WorkflowContext;
use super::error::WorkflowError;
use super::failure::FailureFunction;

/// Future returned by a workflow function.
pub type WorkflowFuture<'a> = BoxFuture<'a, Result<Value, WorkflowError>>;

/// A workflow function: replayed from the start on every invocation.
pub trait WorkflowFn: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a WorkflowContext) -> WorkflowFuture<'a>;
}

impl<F> WorkflowFn for F
where
    F: for<'a> Fn(&'a WorkflowContext) -> WorkflowFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, ctx: &'a WorkflowContext) -> WorkflowFuture<'a> {
        (self)(ctx)
    }
}

/// Per-endpoint overrides. Unset fields fall back to `EngineConfig`.
#[derive(Clone, Default)]
pub struct WorkflowOptions {
    pub retries: Option<u32>,
    pub failure_url: Option<String>,
    pub failure_function: Option<Arc<dyn FailureFunction>>,
    pub verbose: Option<bool>,
    /// Full self-referencing URL of this endpoint.
    pub url: Option<String>,
    /// Base URL; the endpoint URL becomes `{base_url}/workflows/{name}`.
    pub base_url: Option<String>,
    pub wait_timeout: Option<Duration>,
}

impl WorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = Some(url.into());
        self
    }

    pub fn failure_function<F: FailureFunction + 'static>(mut self, function: F) -> Self {
        self.failure_function = Some(Arc::new(function));
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for WorkflowOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOptions")
            .field("retries", &self.retries)
            .field("failure_url", &self.failure_url)
            .field("failure_function", &self.failure_function.is_some())
            .field("verbose", &self.verbose)
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

/// Options after applying config defaults.
#[derive(Clone)]
pub struct ResolvedOptions {
    pub retries: u32,
    pub verbose: bool,
    pub failure_url: Option<String>,
    pub failure_function: Option<Arc<dyn FailureFunction>>,
    pub wait_timeout: Duration,
    pub backoff: BackoffConfig,
    pub lease: Duration,
}

impl ResolvedOptions {
    pub fn resolve(options: &WorkflowOptions, config: &EngineConfig) -> Self {
        Self {
            retries: options.retries.unwrap_or(config.defaults.retries),
            verbose: options.verbose.unwrap_or(config.defaults.verbose),
            failure_url: options
                .failure_url
                .clone()
                .or_else(|| config.defaults.failure_url.clone()),
            failure_function: options.failure_function.clone(),
            wait_timeout: options
                .wait_timeout
                .unwrap_or(Duration::from_secs(config.defaults.wait_timeout_secs)),
            backoff: config.retry,
            lease: Duration::from_secs(config.lease_secs),
        }
    }
}

/// A registered workflow.
pub struct RegisteredWorkflow {
    pub name: String,
    pub options: WorkflowOptions,
    pub function: Arc<dyn WorkflowFn>,
}

impl RegisteredWorkflow {
    /// The self-referencing URL of this endpoint.
    ///
    /// Precedence: explicit `url`, then `base_url` (endpoint or config), then
    /// the URL the current request arrived on.
    pub fn endpoint_url(&self, config_base_url: Option<&str>, request_url: &str) -> String {
        if let Some(url) = &self.options.url {
            return url.clone();
        }
        match self.options.base_url.as_deref().or(config_base_url) {
            Some(base) => format!("{}/workflows/{}", base.trim_end_matches('/'), self.name),
            None => request_url.to_string(),
        }
    }
}

/// Concurrent map of workflow name to registration.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: Arc<DashMap<String, Arc<RegisteredWorkflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a workflow under `name`.
    pub fn register<F>(&self, name: impl Into<String>, options: WorkflowOptions, function: F)
    where
        F: for<'a> Fn(&'a WorkflowContext) -> WorkflowFuture<'a> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(workflow = %name, "registered workflow");
        self.workflows.insert(
            name.clone(),
            Arc::new(RegisteredWorkflow {
                name,
                options,
                function: Arc::new(function),
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.workflows.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(_ctx: &WorkflowContext) -> WorkflowFuture<'_> {
        Box::pin(async { Ok(json!(null)) })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register("b", WorkflowOptions::new(), noop);
        registry.register("a", WorkflowOptions::new().retries(1), noop);

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().options.retries, Some(1));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_resolve_uses_config_defaults() {
        let mut config = EngineConfig::default();
        config.defaults.failure_url = Some("https://hooks.example.com/failed".to_string());
        let resolved = ResolvedOptions::resolve(&WorkflowOptions::new(), &config);
        assert_eq!(resolved.retries, 3);
        assert!(!resolved.verbose);
        assert_eq!(resolved.wait_timeout, Duration::from_secs(604_800));
        assert_eq!(resolved.lease, Duration::from_secs(300));
        assert_eq!(
            resolved.failure_url.as_deref(),
            Some("https://hooks.example.com/failed")
        );

        let overridden = ResolvedOptions::resolve(
            &WorkflowOptions::new().retries(0).verbose(true),
            &config,
        );
        assert_eq!(overridden.retries, 0);
        assert!(overridden.verbose);
    }

    #[test]
    fn test_endpoint_url_precedence() {
        let registry = WorkflowRegistry::new();
        registry.register("order", WorkflowOptions::new(), noop);
        registry.register(
            "explicit",
            WorkflowOptions::new().url("https://flows.example.com/custom"),
            noop,
        );
        registry.register(
            "based",
            WorkflowOptions::new().base_url("https://edge.example.com/"),
            noop,
        );

        let order = registry.get("order").unwrap();
        assert_eq!(
            order.endpoint_url(None, "http://127.0.0.1:8340/workflows/order"),
            "http://127.0.0.1:8340/workflows/order"
        );
        assert_eq!(
            order.endpoint_url(Some("https://flows.example.com"), "http://ignored"),
            "https://flows.example.com/workflows/order"
        );
        assert_eq!(
            registry.get("explicit").unwrap().endpoint_url(Some("https://x"), "http://y"),
            "https://flows.example.com/custom"
        );
        assert_eq!(
            registry.get("based").unwrap().endpoint_url(Some("https://x"), "http://y"),
            "https://edge.example.com/workflows/based"
        );
    }
}
