//! Typed workers and the registry jobs are dispatched against.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strand_types::error::RepositoryError;
use strand_types::job::{JobError, WorkerInfo, clamp_progress};
use uuid::Uuid;

use crate::repository::job::JobStore;

type WorkerHandler<J> =
    Arc<dyn Fn(Value, JobContext<J>) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Handle a running worker uses to report on its own job.
pub struct JobContext<J: JobStore> {
    store: Arc<J>,
    job_id: Uuid,
}

impl<J: JobStore> Clone for JobContext<J> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            job_id: self.job_id,
        }
    }
}

impl<J: JobStore> JobContext<J> {
    pub(crate) fn new(store: Arc<J>, job_id: Uuid) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Report progress; values outside 0..=100 are clamped.
    pub async fn progress(&self, percent: i64) -> Result<(), RepositoryError> {
        self.store
            .update_progress(&self.job_id, clamp_progress(percent))
            .await
    }

    /// Append a line to the job's log.
    pub async fn log(&self, message: impl AsRef<str>) -> Result<(), RepositoryError> {
        let message = message.as_ref();
        tracing::debug!(job_id = %self.job_id, message, "job log");
        self.store.append_log(&self.job_id, message).await
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A background worker with a typed, schema-described input.
pub struct Worker<J: JobStore> {
    pub id: String,
    pub description: Option<String>,
    input_schema: Value,
    validate: fn(&Value) -> Result<(), String>,
    handler: WorkerHandler<J>,
}

fn validate_as<I: DeserializeOwned>(input: &Value) -> Result<(), String> {
    I::deserialize(input).map(|_| ()).map_err(|e| e.to_string())
}

impl<J: JobStore + 'static> Worker<J> {
    /// Register `handler` for inputs of type `I`.
    ///
    /// The JSON schema of `I` is published in worker listings; dispatch
    /// validates inputs by deserializing them into `I`.
    pub fn new<I, F, Fut>(id: &str, handler: F) -> Self
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(I, JobContext<J>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        let input_schema = serde_json::to_value(schemars::schema_for!(I)).unwrap_or(Value::Null);
        Self {
            id: id.to_string(),
            description: None,
            input_schema,
            validate: validate_as::<I>,
            handler: Arc::new(move |input, ctx| -> BoxFuture<'static, Result<Value, JobError>> {
                match serde_json::from_value::<I>(input) {
                    Ok(typed) => Box::pin(handler(typed, ctx)),
                    Err(e) => {
                        let error = JobError::named("ValidationError", e.to_string());
                        Box::pin(async move { Err(error) })
                    }
                }
            }),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn validate(&self, input: &Value) -> Result<(), String> {
        (self.validate)(input)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    pub(crate) fn run(
        &self,
        input: Value,
        ctx: JobContext<J>,
    ) -> BoxFuture<'static, Result<Value, JobError>> {
        (self.handler)(input, ctx)
    }
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

/// Registered workers keyed by ID. Cloned handles share the table.
pub struct WorkerRegistry<J: JobStore> {
    workers: Arc<DashMap<String, Arc<Worker<J>>>>,
}

impl<J: JobStore> Clone for WorkerRegistry<J> {
    fn clone(&self) -> Self {
        Self {
            workers: Arc::clone(&self.workers),
        }
    }
}

impl<J: JobStore> Default for WorkerRegistry<J> {
    fn default() -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
        }
    }
}

impl<J: JobStore + 'static> WorkerRegistry<J> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker<J>) {
        tracing::debug!(worker_id = %worker.id, "registered worker");
        self.workers.insert(worker.id.clone(), Arc::new(worker));
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<Worker<J>>> {
        self.workers.get(worker_id).map(|w| Arc::clone(&w))
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// Worker summaries sorted by ID.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut list: Vec<WorkerInfo> = self.workers.iter().map(|w| w.info()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn clear(&self) {
        self.workers.clear();
    }
}
