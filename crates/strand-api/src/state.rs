//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by both CLI and REST API.
//! The engine and job service are generic over their stores; AppState pins
//! them to the SQLite implementations and shares one event bus between them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strand_core::event::EventBus;
use strand_core::job::{BoxDispatchTarget, BoxJobNotifier, JobService, WorkerRegistry};
use strand_core::workflow::{Engine, Scheduler, WorkflowRegistry};
use strand_infra::config::{data_dir, database_url, load_config};
use strand_infra::dispatch::{CallbackVerifier, HttpTriggerTarget, HttpWebhookNotifier};
use strand_infra::sqlite::{DatabasePool, SqliteJobStore, SqliteWorkflowStore};
use strand_types::config::StrandConfig;

use crate::builtins;

/// Concrete type aliases for the service generics pinned to infra implementations.
pub type ConcreteEngine = Engine<SqliteWorkflowStore>;
pub type ConcreteScheduler = Scheduler<SqliteWorkflowStore>;
pub type ConcreteJobService = JobService<SqliteJobStore>;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Shared application state holding all services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub scheduler: ConcreteScheduler,
    pub jobs: ConcreteJobService,
    pub verifier: CallbackVerifier,
    pub config: Arc<StrandConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, connect to DB, wire services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        Self::from_pool(db_pool, config, data_dir)
    }

    /// Wire services on top of an open pool.
    pub fn from_pool(
        db_pool: DatabasePool,
        config: StrandConfig,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let timeout = Duration::from_secs(config.dispatch.request_timeout_secs);

        // Job service: local workers, optional remote target, signed callbacks
        let workers = WorkerRegistry::new();
        builtins::register_workers(&workers);

        let notifier = HttpWebhookNotifier::new(config.webhook.secret.as_deref(), timeout)?;
        let mut builder = JobService::builder(Arc::new(SqliteJobStore::new(db_pool.clone())))
            .workers(workers)
            .notifier(BoxJobNotifier::new(notifier))
            .event_bus(bus.clone())
            .default_mode(config.dispatch.mode);
        if let Some(url) = &config.dispatch.trigger_url {
            let target = HttpTriggerTarget::new(url, timeout)?;
            tracing::debug!(endpoint = target.endpoint(), "remote dispatch enabled");
            builder = builder.target(BoxDispatchTarget::new(target));
        }
        let jobs = builder.build();

        // Workflow engine
        let registry = WorkflowRegistry::new();
        builtins::register_workflows(&registry, &jobs);
        let engine = Engine::new(
            Arc::new(SqliteWorkflowStore::new(db_pool.clone())),
            registry,
            bus,
        );
        let scheduler = Scheduler::new(engine.clone());

        Ok(Self {
            engine,
            scheduler,
            jobs,
            verifier: CallbackVerifier::from_config(&config.webhook),
            config: Arc::new(config),
            data_dir,
            db_pool,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// State backed by a fresh SQLite file. Keep the `TempDir` alive for the test.
    pub async fn state_with(config: StrandConfig) -> (AppState, TempDir) {
        let tmp = TempDir::new().unwrap();
        let pool = DatabasePool::new(&database_url(tmp.path())).await.unwrap();
        let state = AppState::from_pool(pool, config, tmp.path().to_path_buf()).unwrap();
        (state, tmp)
    }

    pub async fn test_state() -> (AppState, TempDir) {
        state_with(StrandConfig::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use strand_types::job::DispatchMode;

    #[tokio::test]
    async fn builtins_are_registered() {
        let (state, _tmp) = test_state().await;
        let workflows = state.engine.registry().list();
        assert!(workflows.iter().any(|(id, _)| id == "approval"));
        assert!(workflows.iter().any(|(id, _)| id == "run-job"));

        let workers: Vec<String> = state.jobs.workers().list().into_iter().map(|w| w.id).collect();
        for id in ["echo", "sum", "fail"] {
            assert!(workers.iter().any(|w| w == id), "missing worker {id}");
        }
        assert!(!state.jobs.has_remote_target());
    }

    #[tokio::test]
    async fn trigger_url_enables_remote_target() {
        let mut config = StrandConfig::default();
        config.dispatch.trigger_url = Some("http://127.0.0.1:9".to_string());
        config.dispatch.mode = DispatchMode::Remote;
        let (state, _tmp) = state_with(config).await;
        assert!(state.jobs.has_remote_target());
        assert_eq!(state.config.dispatch.mode, DispatchMode::Remote);
    }
}
