//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the concrete engine used by both CLI and REST API. The
//! engine is generic over repository and scheduler traits; AppState pins
//! them to the SQLite repository and the configured scheduler backend.

use std::sync::Arc;

use waypoint_core::workflow::{WorkflowClient, WorkflowEngine, WorkflowRegistry};
use waypoint_infra::config::{data_dir, load_config, resolve_database_url};
use waypoint_infra::scheduler::{LocalScheduler, SchedulerBackend};
use waypoint_infra::signature::RequestSigner;
use waypoint_infra::sqlite::pool::DatabasePool;
use waypoint_infra::sqlite::workflow::SqliteWorkflowRepository;
use waypoint_types::config::{EngineConfig, SchedulerKind};

/// The engine pinned to the infra implementations.
pub type Engine = WorkflowEngine<SqliteWorkflowRepository, SchedulerBackend>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub client: Arc<WorkflowClient<SchedulerBackend>>,
    pub signer: RequestSigner,
}

impl AppState {
    /// Load configuration, open the database and build the engine.
    ///
    /// `force_local` selects the in-process scheduler regardless of config;
    /// `listen` overrides the configured listen address.
    pub async fn init(force_local: bool, listen: Option<String>) -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut config = load_config(&data_dir).await;
        if force_local {
            config.scheduler.kind = SchedulerKind::Local;
        }
        if let Some(listen) = listen {
            config.listen = listen;
        }
        let db_pool = DatabasePool::new(&resolve_database_url(&config)).await?;

        tracing::debug!(data_dir = %data_dir.display(), "data directory ready");
        Self::build(config, db_pool, crate::demo::registry())
    }

    /// Wire the engine from already-opened resources.
    pub fn build(
        config: EngineConfig,
        db_pool: DatabasePool,
        registry: WorkflowRegistry,
    ) -> anyhow::Result<Self> {
        let signer = RequestSigner::from_config(&config.signing);
        let scheduler = Arc::new(SchedulerBackend::from_config(
            &config.scheduler,
            signer.clone(),
            config.retry,
        )?);
        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool));
        let client = Arc::new(WorkflowClient::new(
            Arc::clone(&scheduler),
            config.defaults.retries,
        ));

        tracing::debug!(
            workflows = registry.len(),
            signing = signer.is_enabled(),
            "engine initialized"
        );
        let engine = WorkflowEngine::new(repo, scheduler, registry, config);

        Ok(Self {
            engine,
            client,
            signer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// The in-process scheduler, when it is the configured backend.
    pub fn local_scheduler(&self) -> Option<&LocalScheduler> {
        self.engine.scheduler().local()
    }

    /// URL of a workflow endpoint as seen from outside the server.
    ///
    /// Uses `base_url` when configured, otherwise the listen address.
    pub fn workflow_url(&self, name: &str) -> String {
        let base = self
            .config()
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.config().listen));
        format!("{}/workflows/{name}", base.trim_end_matches('/'))
    }

    /// Deliver what the local scheduler has due before a CLI command exits.
    ///
    /// Delayed messages stay queued in this process and are lost on exit.
    pub async fn flush_local(&self) {
        if let Some(local) = self.local_scheduler() {
            let delivered = local.flush().await;
            let remaining = local.queue().len();
            tracing::debug!(delivered, remaining, "local scheduler flushed");
            if remaining > 0 {
                tracing::warn!(
                    remaining,
                    "delayed messages were dropped; run `wpt serve --local` to keep them"
                );
            }
        }
    }
}
