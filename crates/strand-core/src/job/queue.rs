//! Queue configs and step chaining.
//!
//! Each queue step is an ordinary job whose metadata carries a
//! `queueContext`. When that job finishes, the runner hands it back here
//! and the next step is scheduled on a spawned task (after its delay).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use strand_types::event::EngineEvent;
use strand_types::job::{DispatchOptions, JobRecord, JobStatus, QUEUE_CONTEXT_KEY, QueueContext};
use strand_types::queue::{
    OnFailure, QueueConfig, QueueDispatchReceipt, QueueJob, QueueJobStatus, QueueStepStatus,
};
use uuid::Uuid;

use super::JobService;
use super::error::{DispatchError, QueueError};
use super::mapping::map_input;
use crate::repository::job::JobStore;

// ---------------------------------------------------------------------------
// QueueRegistry
// ---------------------------------------------------------------------------

/// Registered queue configs keyed by queue ID. Cloned handles share the table.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: Arc<DashMap<String, Arc<QueueConfig>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: QueueConfig) {
        self.queues.insert(config.id.clone(), Arc::new(config));
    }

    pub fn get(&self, queue_id: &str) -> Option<Arc<QueueConfig>> {
        self.queues.get(queue_id).map(|q| Arc::clone(&q))
    }

    /// Configs sorted by ID.
    pub fn list(&self) -> Vec<Arc<QueueConfig>> {
        let mut list: Vec<Arc<QueueConfig>> = self.queues.iter().map(|q| Arc::clone(&q)).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn clear(&self) {
        self.queues.clear();
    }
}

/// Dispatch settings carried from one step to the next.
#[derive(Debug, Clone)]
struct Carry {
    webhook_url: Option<String>,
    metadata: Map<String, Value>,
}

impl Carry {
    fn from_options(options: &DispatchOptions) -> Result<Self, QueueError> {
        let metadata = match &options.metadata {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(DispatchError::InvalidMetadata(format!(
                    "expected an object, got {other}"
                ))
                .into());
            }
        };
        Ok(Self {
            webhook_url: options.webhook_url.clone(),
            metadata,
        })
    }

    fn from_record(record: &JobRecord) -> Self {
        let mut metadata = record.metadata.as_object().cloned().unwrap_or_default();
        metadata.remove(QUEUE_CONTEXT_KEY);
        Self {
            webhook_url: record.webhook_url.clone(),
            metadata,
        }
    }

    fn options_for(&self, context: &QueueContext) -> Result<DispatchOptions, QueueError> {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            QUEUE_CONTEXT_KEY.to_string(),
            serde_json::to_value(context).map_err(|e| QueueError::InvalidConfig(e.to_string()))?,
        );
        Ok(DispatchOptions {
            mode: None,
            webhook_url: self.webhook_url.clone(),
            metadata: Some(Value::Object(metadata)),
        })
    }
}

// ---------------------------------------------------------------------------
// Queue chaining
// ---------------------------------------------------------------------------

impl<J: JobStore + 'static> JobService<J> {
    /// Register a queue after checking that every step names a known worker.
    pub fn register_queue(&self, config: QueueConfig) -> Result<(), QueueError> {
        if config.id.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue id must not be empty".to_string()));
        }
        if config.steps.is_empty() {
            return Err(QueueError::InvalidConfig(format!(
                "queue '{}' has no steps",
                config.id
            )));
        }
        if let Some(step) = config
            .steps
            .iter()
            .find(|s| !self.inner.workers.contains(&s.worker_id))
        {
            return Err(QueueError::InvalidConfig(format!(
                "queue '{}' references unknown worker '{}'",
                config.id, step.worker_id
            )));
        }
        tracing::debug!(queue_id = %config.id, steps = config.steps.len(), "registered queue");
        self.inner.queues.insert(config);
        Ok(())
    }

    pub async fn get_queue_job(&self, queue_job_id: Uuid) -> Result<Option<QueueJob>, QueueError> {
        Ok(self.inner.store.get_queue_job(&queue_job_id).await?)
    }

    /// Start a run of `queue_id`, dispatching its first step immediately.
    ///
    /// The first step receives `initial_input` (or its mapping of it).
    pub async fn dispatch_queue(
        &self,
        queue_id: &str,
        initial_input: Value,
        options: DispatchOptions,
    ) -> Result<QueueDispatchReceipt, QueueError> {
        let config = self
            .inner
            .queues
            .get(queue_id)
            .ok_or_else(|| QueueError::UnknownQueue(queue_id.to_string()))?;
        let Some(first) = config.steps.first() else {
            return Err(QueueError::InvalidConfig(format!("queue '{queue_id}' has no steps")));
        };
        let carry = Carry::from_options(&options)?;

        let queue_job = QueueJob::start(Uuid::now_v7(), &config, initial_input.clone());
        self.inner.store.create_queue_job(&queue_job).await?;

        let input = match &first.map_input_from_prev {
            Some(map) => map_input(map, &initial_input, &initial_input),
            None => initial_input.clone(),
        };
        let context = QueueContext {
            id: config.id.clone(),
            step_index: 0,
            initial_input,
            queue_job_id: queue_job.id,
        };
        let mut step_options = carry.options_for(&context)?;
        step_options.mode = options.mode;

        match self.dispatch(&first.worker_id, input, step_options).await {
            Ok(receipt) => {
                self.inner
                    .store
                    .update_queue_step(&queue_job.id, 0, Some(receipt.job_id), QueueStepStatus::Dispatched)
                    .await?;
                tracing::info!(
                    queue_id,
                    queue_job_id = %queue_job.id,
                    job_id = %receipt.job_id,
                    "queue dispatched"
                );
                Ok(QueueDispatchReceipt {
                    job_id: receipt.job_id,
                    queue_id: config.id.clone(),
                    queue_job_id: queue_job.id,
                    status: receipt.status,
                })
            }
            Err(e) => {
                // A failed remote submission was already advanced by the runner.
                if !matches!(e, DispatchError::Submission { .. }) {
                    self.inner
                        .store
                        .update_queue_step(&queue_job.id, 0, None, QueueStepStatus::Error)
                        .await?;
                    self.close_queue(&config, queue_job.id, QueueJobStatus::Failed)
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Called by the runner when a queue step's job reaches a terminal status.
    pub(crate) async fn on_step_finished(
        &self,
        record: &JobRecord,
        context: QueueContext,
    ) -> Result<(), QueueError> {
        let step_status = QueueStepStatus::from(record.status);
        let output = match record.status {
            JobStatus::Success => Some(record.output.clone().unwrap_or(Value::Null)),
            _ => None,
        };
        self.advance(context, Some(record.id), step_status, output, Carry::from_record(record))
            .await
    }

    /// Record the end of `context.step_index` and schedule the next step.
    async fn advance(
        &self,
        context: QueueContext,
        job_id: Option<Uuid>,
        status: QueueStepStatus,
        output: Option<Value>,
        carry: Carry,
    ) -> Result<(), QueueError> {
        let store = &self.inner.store;
        let queue_job_id = context.queue_job_id;
        store
            .update_queue_step(&queue_job_id, context.step_index, job_id, status)
            .await?;

        let Some(config) = self.inner.queues.get(&context.id) else {
            tracing::warn!(queue_id = %context.id, queue_job_id = %queue_job_id, "queue config gone, failing run");
            store
                .set_queue_job_status(&queue_job_id, QueueJobStatus::Failed)
                .await?;
            return Ok(());
        };

        let failed = status != QueueStepStatus::Success;
        if failed && config.on_failure == OnFailure::Abort {
            for index in context.step_index + 1..config.steps.len() {
                store
                    .update_queue_step(&queue_job_id, index, None, QueueStepStatus::Skipped)
                    .await?;
            }
            return self
                .close_queue(&config, queue_job_id, QueueJobStatus::Failed)
                .await;
        }

        let next_index = context.step_index + 1;
        let Some(next) = config.steps.get(next_index) else {
            let queue_job = store
                .get_queue_job(&queue_job_id)
                .await?
                .ok_or(QueueError::QueueJobNotFound(queue_job_id))?;
            let status = if queue_job
                .steps
                .iter()
                .all(|s| s.status == QueueStepStatus::Success)
            {
                QueueJobStatus::Completed
            } else {
                QueueJobStatus::Partial
            };
            return self.close_queue(&config, queue_job_id, status).await;
        };

        let prev = match output {
            Some(output) => output,
            None => self.last_successful_output(&context).await?,
        };
        let input = match &next.map_input_from_prev {
            Some(map) => map_input(map, &prev, &context.initial_input),
            None => prev,
        };
        let next_context = QueueContext {
            step_index: next_index,
            ..context
        };
        self.schedule_step(
            next_context,
            next.worker_id.clone(),
            input,
            next.delay_seconds.unwrap_or(0),
            carry,
        );
        Ok(())
    }

    /// Output of the latest successful step before `context.step_index`,
    /// else the queue's initial input.
    async fn last_successful_output(&self, context: &QueueContext) -> Result<Value, QueueError> {
        let queue_job = self
            .inner
            .store
            .get_queue_job(&context.queue_job_id)
            .await?
            .ok_or(QueueError::QueueJobNotFound(context.queue_job_id))?;
        for step in queue_job.steps[..context.step_index.min(queue_job.steps.len())]
            .iter()
            .rev()
        {
            if step.status != QueueStepStatus::Success {
                continue;
            }
            if let Some(job_id) = step.job_id {
                if let Some(record) = self.inner.store.get_job(&job_id).await? {
                    return Ok(record.output.unwrap_or(Value::Null));
                }
            }
        }
        Ok(context.initial_input.clone())
    }

    /// Dispatch a step on a spawned task after `delay_seconds`.
    fn schedule_step(
        &self,
        context: QueueContext,
        worker_id: String,
        input: Value,
        delay_seconds: u64,
        carry: Carry,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            if delay_seconds > 0 {
                tracing::debug!(
                    queue_job_id = %context.queue_job_id,
                    step = context.step_index,
                    delay_seconds,
                    "delaying queue step"
                );
                tokio::time::sleep(Duration::from_secs(delay_seconds)).await;
            }
            if let Err(e) = service.dispatch_step(context, worker_id, input, carry).await {
                tracing::error!(error = %e, "queue step dispatch failed");
            }
        });
    }

    async fn dispatch_step(
        &self,
        context: QueueContext,
        worker_id: String,
        input: Value,
        carry: Carry,
    ) -> Result<(), QueueError> {
        let options = carry.options_for(&context)?;
        match self.dispatch(&worker_id, input, options).await {
            Ok(receipt) => {
                self.inner
                    .store
                    .update_queue_step(
                        &context.queue_job_id,
                        context.step_index,
                        Some(receipt.job_id),
                        QueueStepStatus::Dispatched,
                    )
                    .await?;
                Ok(())
            }
            // The runner already advanced the queue for the failed record.
            Err(DispatchError::Submission { .. }) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    queue_job_id = %context.queue_job_id,
                    step = context.step_index,
                    error = %e,
                    "queue step rejected"
                );
                self.advance(context, None, QueueStepStatus::Error, None, carry)
                    .await
            }
        }
    }

    async fn close_queue(
        &self,
        config: &QueueConfig,
        queue_job_id: Uuid,
        status: QueueJobStatus,
    ) -> Result<(), QueueError> {
        self.inner
            .store
            .set_queue_job_status(&queue_job_id, status)
            .await?;
        tracing::info!(queue_id = %config.id, queue_job_id = %queue_job_id, status = status.as_str(), "queue finished");
        self.inner.bus.publish(EngineEvent::QueueFinished {
            queue_job_id,
            queue_id: config.id.clone(),
            status,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use strand_types::job::JobError;
    use strand_types::queue::{InputMap, QueueStep};
    use tokio::time::Instant;

    use crate::job::{Worker, WorkerRegistry};
    use crate::storage::memory::MemoryStore;

    type Seen = Arc<Mutex<Vec<(&'static str, Instant, Value)>>>;

    #[derive(Deserialize, JsonSchema)]
    struct ValueInput {
        value: i64,
    }

    #[derive(Deserialize, JsonSchema)]
    struct XInput {
        x: i64,
    }

    fn service(seen: Seen) -> JobService<MemoryStore> {
        let workers = WorkerRegistry::new();
        let a_seen = Arc::clone(&seen);
        workers.register(Worker::new("a", move |input: ValueInput, _ctx| {
            let seen = Arc::clone(&a_seen);
            async move {
                seen.lock()
                    .unwrap()
                    .push(("a", Instant::now(), json!({"value": input.value})));
                Ok(json!({"value": input.value, "done": true}))
            }
        }));
        let b_seen = Arc::clone(&seen);
        workers.register(Worker::new("b", move |input: XInput, _ctx| {
            let seen = Arc::clone(&b_seen);
            async move {
                seen.lock()
                    .unwrap()
                    .push(("b", Instant::now(), json!({"x": input.x})));
                Ok(json!({"x": input.x}))
            }
        }));
        workers.register(Worker::new("fail", |_input: Value, _ctx| async move {
            Err::<Value, _>(JobError::new("nope"))
        }));
        workers.register(Worker::new("echo", |input: Value, _ctx| async move { Ok(input) }));
        JobService::builder(Arc::new(MemoryStore::new()))
            .workers(workers)
            .build()
    }

    async fn wait_queue(service: &JobService<MemoryStore>, id: Uuid) -> QueueJob {
        for _ in 0..200 {
            let job = service.get_queue_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue job {id} did not finish");
    }

    #[tokio::test(start_paused = true)]
    async fn second_step_runs_after_delay_with_mapped_input() {
        let seen: Seen = Arc::default();
        let service = service(Arc::clone(&seen));
        service
            .register_queue(QueueConfig {
                id: "q".to_string(),
                steps: vec![
                    QueueStep::new("a"),
                    QueueStep::new("b")
                        .with_delay(2)
                        .with_map(InputMap::fields([("x", "prev.value")])),
                ],
                schedule: None,
                on_failure: OnFailure::Continue,
            })
            .unwrap();

        let receipt = service
            .dispatch_queue("q", json!({"value": 5}), DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt.queue_id, "q");
        assert_eq!(receipt.status, JobStatus::Queued);

        let queue_job = wait_queue(&service, receipt.queue_job_id).await;
        assert_eq!(queue_job.status, QueueJobStatus::Completed);
        assert!(queue_job.finished_at.is_some());
        assert!(queue_job.steps.iter().all(|s| s.job_id.is_some()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let (_, a_at, a_input) = &seen[0];
        let (_, b_at, b_input) = &seen[1];
        assert_eq!(a_input, &json!({"value": 5}));
        assert_eq!(b_input, &json!({"x": 5}));
        assert!(b_at.duration_since(*a_at) >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_continue_passes_last_success_and_ends_partial() {
        let service = service(Arc::default());
        service
            .register_queue(QueueConfig {
                id: "c".to_string(),
                steps: vec![QueueStep::new("echo"), QueueStep::new("fail"), QueueStep::new("echo")],
                schedule: None,
                on_failure: OnFailure::Continue,
            })
            .unwrap();

        let receipt = service
            .dispatch_queue("c", json!({"keep": 1}), DispatchOptions::default())
            .await
            .unwrap();
        let queue_job = wait_queue(&service, receipt.queue_job_id).await;
        assert_eq!(queue_job.status, QueueJobStatus::Partial);
        let statuses: Vec<QueueStepStatus> = queue_job.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![QueueStepStatus::Success, QueueStepStatus::Error, QueueStepStatus::Success]
        );

        let last = queue_job.steps[2].job_id.unwrap();
        let record = service.get_job(last).await.unwrap().unwrap();
        assert_eq!(record.input, json!({"keep": 1}));
        assert_eq!(record.queue_context().unwrap().step_index, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_abort_skips_remaining_steps() {
        let service = service(Arc::default());
        let mut bus = service.event_bus().subscribe();
        service
            .register_queue(QueueConfig {
                id: "x".to_string(),
                steps: vec![QueueStep::new("fail"), QueueStep::new("echo")],
                schedule: None,
                on_failure: OnFailure::Abort,
            })
            .unwrap();

        let receipt = service
            .dispatch_queue("x", json!({}), DispatchOptions::default())
            .await
            .unwrap();
        let queue_job = wait_queue(&service, receipt.queue_job_id).await;
        assert_eq!(queue_job.status, QueueJobStatus::Failed);
        assert_eq!(queue_job.steps[1].status, QueueStepStatus::Skipped);
        assert!(queue_job.steps[1].job_id.is_none());

        let mut finished = None;
        while let Ok(event) = bus.try_recv() {
            if let EngineEvent::QueueFinished { status, .. } = event {
                finished = Some(status);
            }
        }
        assert_eq!(finished, Some(QueueJobStatus::Failed));
    }

    #[test]
    fn register_rejects_unknown_workers_and_empty_queues() {
        let service = service(Arc::default());
        let err = service
            .register_queue(QueueConfig {
                id: "bad".to_string(),
                steps: vec![QueueStep::new("ghost")],
                schedule: None,
                on_failure: OnFailure::Continue,
            })
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = service
            .register_queue(QueueConfig {
                id: "empty".to_string(),
                steps: vec![],
                schedule: None,
                on_failure: OnFailure::Continue,
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
        assert!(service.queues().list().is_empty());
    }
}
