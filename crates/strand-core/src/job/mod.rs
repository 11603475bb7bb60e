//! Background jobs: dispatch, worker execution and queue chaining.
//!
//! `JobService` is the single entry point. Its behaviour is split across
//! the submodules:
//! - `dispatch` -- `dispatch()` and the trigger endpoint contract
//! - `runner` -- worker-side execution of one job
//! - `queue` -- queue configs and step chaining
//! - `mapping` -- step input mapping
//! - `cache` -- terminal record cache

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod mapping;
pub mod queue;
pub mod runner;
pub mod worker;

use std::sync::Arc;

use strand_types::job::{DispatchMode, JobRecord};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::job::JobStore;

pub use cache::JobCache;
pub use dispatch::{BoxDispatchTarget, BoxJobNotifier, DispatchTarget, JobNotifier};
pub use error::{DispatchError, QueueError};
pub use queue::QueueRegistry;
pub use worker::{JobContext, Worker, WorkerRegistry};

/// Dispatches jobs, runs local workers and chains queue steps.
///
/// Cheap to clone; all clones share the same registries, cache and targets.
pub struct JobService<J: JobStore> {
    inner: Arc<Inner<J>>,
}

struct Inner<J: JobStore> {
    store: Arc<J>,
    workers: WorkerRegistry<J>,
    queues: QueueRegistry,
    cache: JobCache,
    target: Option<BoxDispatchTarget>,
    notifier: Option<BoxJobNotifier>,
    bus: EventBus,
    default_mode: DispatchMode,
}

impl<J: JobStore> Clone for JobService<J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<J: JobStore + 'static> JobService<J> {
    pub fn builder(store: Arc<J>) -> JobServiceBuilder<J> {
        JobServiceBuilder {
            store,
            workers: WorkerRegistry::new(),
            queues: QueueRegistry::new(),
            target: None,
            notifier: None,
            bus: EventBus::default(),
            default_mode: DispatchMode::Auto,
        }
    }

    pub fn store(&self) -> &Arc<J> {
        &self.inner.store
    }

    pub fn workers(&self) -> &WorkerRegistry<J> {
        &self.inner.workers
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.inner.queues
    }

    pub fn cache(&self) -> &JobCache {
        &self.inner.cache
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Whether a remote trigger target is configured.
    pub fn has_remote_target(&self) -> bool {
        self.inner.target.is_some()
    }

    /// Read a job record, serving finished jobs from the cache.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, DispatchError> {
        if let Some(record) = self.inner.cache.get(&job_id) {
            return Ok(Some(record));
        }
        let record = self.inner.store.get_job(&job_id).await?;
        if let Some(record) = &record {
            self.inner.cache.insert(record);
        }
        Ok(record)
    }

    pub async fn list_jobs(
        &self,
        worker_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<JobRecord>, DispatchError> {
        Ok(self.inner.store.list_jobs(worker_id, limit).await?)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct JobServiceBuilder<J: JobStore> {
    store: Arc<J>,
    workers: WorkerRegistry<J>,
    queues: QueueRegistry,
    target: Option<BoxDispatchTarget>,
    notifier: Option<BoxJobNotifier>,
    bus: EventBus,
    default_mode: DispatchMode,
}

impl<J: JobStore + 'static> JobServiceBuilder<J> {
    pub fn workers(mut self, workers: WorkerRegistry<J>) -> Self {
        self.workers = workers;
        self
    }

    pub fn queues(mut self, queues: QueueRegistry) -> Self {
        self.queues = queues;
        self
    }

    /// Remote execution backend used by `remote` (and `auto`) dispatch.
    pub fn target(mut self, target: BoxDispatchTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Delivers webhook callbacks for finished jobs that carry a `webhookUrl`.
    pub fn notifier(mut self, notifier: BoxJobNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn default_mode(mut self, mode: DispatchMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn build(self) -> JobService<J> {
        JobService {
            inner: Arc::new(Inner {
                store: self.store,
                workers: self.workers,
                queues: self.queues,
                cache: JobCache::new(),
                target: self.target,
                notifier: self.notifier,
                bus: self.bus,
                default_mode: self.default_mode,
            }),
        }
    }
}
