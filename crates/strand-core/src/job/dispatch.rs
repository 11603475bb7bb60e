//! Job dispatch: the remote target contract and `JobService::dispatch`.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use strand_types::event::EngineEvent;
use strand_types::job::{
    DispatchMode, DispatchOptions, DispatchReceipt, JobError, JobRecord, JobStatus, TriggerBody,
    TriggerRequest, TriggerResponse, WebhookCallback,
};
use strand_types::error::RepositoryError;
use uuid::Uuid;

use super::JobService;
use super::error::DispatchError;
use crate::repository::job::JobStore;

// ---------------------------------------------------------------------------
// Remote target
// ---------------------------------------------------------------------------

/// An external execution backend reachable through a trigger endpoint.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DispatchTarget: Send + Sync {
    fn name(&self) -> &str;

    fn trigger(
        &self,
        request: &TriggerRequest,
    ) -> impl Future<Output = Result<TriggerResponse, DispatchError>> + Send;
}

/// Object-safe version of [`DispatchTarget`] with boxed futures.
pub trait DispatchTargetDyn: Send + Sync {
    fn name(&self) -> &str;

    fn trigger_boxed<'a>(
        &'a self,
        request: &'a TriggerRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TriggerResponse, DispatchError>> + Send + 'a>>;
}

impl<T: DispatchTarget> DispatchTargetDyn for T {
    fn name(&self) -> &str {
        DispatchTarget::name(self)
    }

    fn trigger_boxed<'a>(
        &'a self,
        request: &'a TriggerRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TriggerResponse, DispatchError>> + Send + 'a>> {
        Box::pin(self.trigger(request))
    }
}

/// Type-erased dispatch target for runtime selection.
pub struct BoxDispatchTarget {
    inner: Box<dyn DispatchTargetDyn>,
}

impl BoxDispatchTarget {
    pub fn new<T: DispatchTarget + 'static>(target: T) -> Self {
        Self {
            inner: Box::new(target),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerResponse, DispatchError> {
        self.inner.trigger_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// Webhook notifier
// ---------------------------------------------------------------------------

/// Delivers the completion callback of a job to its `webhookUrl`.
pub trait JobNotifier: Send + Sync {
    fn notify(
        &self,
        url: &str,
        callback: &WebhookCallback,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

pub trait JobNotifierDyn: Send + Sync {
    fn notify_boxed<'a>(
        &'a self,
        url: &'a str,
        callback: &'a WebhookCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

impl<T: JobNotifier> JobNotifierDyn for T {
    fn notify_boxed<'a>(
        &'a self,
        url: &'a str,
        callback: &'a WebhookCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(self.notify(url, callback))
    }
}

pub struct BoxJobNotifier {
    inner: Box<dyn JobNotifierDyn>,
}

impl BoxJobNotifier {
    pub fn new<T: JobNotifier + 'static>(notifier: T) -> Self {
        Self {
            inner: Box::new(notifier),
        }
    }

    pub async fn notify(&self, url: &str, callback: &WebhookCallback) -> Result<(), DispatchError> {
        self.inner.notify_boxed(url, callback).await
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl<J: JobStore + 'static> JobService<J> {
    /// Enqueue one invocation of `worker_id`.
    ///
    /// Unknown workers, invalid input and malformed metadata are rejected
    /// before a record is created. A failed remote submission marks the new
    /// record `error` and returns [`DispatchError::Submission`].
    pub async fn dispatch(
        &self,
        worker_id: &str,
        input: Value,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt, DispatchError> {
        let worker = self
            .inner
            .workers
            .get(worker_id)
            .ok_or_else(|| DispatchError::UnknownWorker(worker_id.to_string()))?;
        worker
            .validate(&input)
            .map_err(|message| DispatchError::Validation {
                worker_id: worker_id.to_string(),
                message,
            })?;
        let metadata = object_metadata(options.metadata)?;
        let mode = self.resolve_mode(options.mode)?;

        let record = JobRecord::queued(Uuid::now_v7(), worker_id, input, metadata, options.webhook_url);
        self.inner.store.create_job(&record).await?;
        self.inner.bus.publish(EngineEvent::JobQueued {
            job_id: record.id,
            worker_id: record.worker_id.clone(),
        });
        tracing::info!(job_id = %record.id, worker_id, mode = ?mode, "job dispatched");

        match mode {
            DispatchMode::Remote => self.submit_remote(&record).await?,
            _ => self.spawn_run(record.id),
        }

        Ok(DispatchReceipt {
            job_id: record.id,
            status: JobStatus::Queued,
        })
    }

    /// Worker side of the trigger endpoint: adopt (or create) the record and run it.
    pub async fn accept_trigger(&self, body: TriggerBody) -> Result<TriggerResponse, DispatchError> {
        let worker = self
            .inner
            .workers
            .get(&body.worker_id)
            .ok_or_else(|| DispatchError::UnknownWorker(body.worker_id.clone()))?;
        worker
            .validate(&body.input)
            .map_err(|message| DispatchError::Validation {
                worker_id: body.worker_id.clone(),
                message,
            })?;

        match self.inner.store.get_job(&body.job_id).await? {
            Some(existing) if existing.status != JobStatus::Queued => {
                return Err(DispatchError::Storage(RepositoryError::Conflict(format!(
                    "job {} is already {}",
                    existing.id, existing.status
                ))));
            }
            Some(_) => {}
            None => {
                let metadata = object_metadata(Some(body.metadata))?;
                let record = JobRecord::queued(
                    body.job_id,
                    &body.worker_id,
                    body.input,
                    metadata,
                    body.webhook_url,
                );
                self.inner.store.create_job(&record).await?;
                self.inner.bus.publish(EngineEvent::JobQueued {
                    job_id: record.id,
                    worker_id: record.worker_id.clone(),
                });
            }
        }

        let message_id = Uuid::now_v7().to_string();
        tracing::info!(job_id = %body.job_id, message_id = %message_id, "trigger accepted");
        self.spawn_run(body.job_id);
        Ok(TriggerResponse {
            message_id,
            job_id: body.job_id,
        })
    }

    fn resolve_mode(&self, requested: Option<DispatchMode>) -> Result<DispatchMode, DispatchError> {
        match requested.unwrap_or(self.inner.default_mode) {
            DispatchMode::Auto if self.inner.target.is_some() => Ok(DispatchMode::Remote),
            DispatchMode::Auto => Ok(DispatchMode::Local),
            DispatchMode::Remote if self.inner.target.is_none() => Err(DispatchError::NoTarget),
            mode => Ok(mode),
        }
    }

    async fn submit_remote(&self, record: &JobRecord) -> Result<(), DispatchError> {
        let Some(target) = &self.inner.target else {
            return Err(DispatchError::NoTarget);
        };
        let request = TriggerRequest {
            worker_id: record.worker_id.clone(),
            body: TriggerBody {
                worker_id: record.worker_id.clone(),
                job_id: record.id,
                input: record.input.clone(),
                context: json!({"origin": "strand", "mode": "remote"}),
                webhook_url: record.webhook_url.clone(),
                metadata: record.metadata.clone(),
                timestamp: Utc::now(),
            },
        };

        match target.trigger(&request).await {
            Ok(response) => {
                tracing::debug!(
                    job_id = %record.id,
                    target = target.name(),
                    message_id = %response.message_id,
                    "job submitted"
                );
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(job_id = %record.id, target = target.name(), error = %message, "job submission failed");
                let failed = self
                    .inner
                    .store
                    .fail_job(&record.id, &JobError::named("DispatchError", message.clone()))
                    .await?;
                self.finished(failed).await;
                Err(DispatchError::Submission {
                    job_id: record.id,
                    message,
                })
            }
        }
    }

    /// Run a job on the runtime in the background.
    pub(crate) fn spawn_run(&self, job_id: Uuid) {
        let service = self.clone();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            if let Err(e) = service.run_job(job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "job run failed");
            }
        });
        tokio::spawn(task);
    }
}

/// Metadata must be a JSON object (absent means empty).
fn object_metadata(metadata: Option<Value>) -> Result<Value, DispatchError> {
    match metadata {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(other) => Err(DispatchError::InvalidMetadata(format!(
            "expected an object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::job::{Worker, WorkerRegistry};
    use crate::storage::memory::MemoryStore;

    struct CountingTarget {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    impl DispatchTarget for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }

        async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerResponse, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DispatchError::Transport("connection refused".to_string()));
            }
            Ok(TriggerResponse {
                message_id: "msg-1".to_string(),
                job_id: request.body.job_id,
            })
        }
    }

    fn workers() -> WorkerRegistry<MemoryStore> {
        let workers = WorkerRegistry::new();
        workers.register(Worker::new("echo", |input: Value, ctx| async move {
            ctx.progress(150).await.map_err(|e| JobError::new(e.to_string()))?;
            ctx.log("echoing").await.map_err(|e| JobError::new(e.to_string()))?;
            Ok(input)
        }));
        workers.register(Worker::new("strict", |input: u32, _ctx| async move {
            Ok(json!(input * 2))
        }));
        workers
    }

    async fn wait_terminal(service: &JobService<MemoryStore>, id: Uuid) -> JobRecord {
        for _ in 0..100 {
            if let Some(record) = service.get_job(id).await.unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn local_dispatch_runs_worker_to_success() {
        let store = Arc::new(MemoryStore::new());
        let service = JobService::builder(Arc::clone(&store)).workers(workers()).build();

        let a = service.dispatch("echo", json!({"v": 1}), DispatchOptions::default()).await.unwrap();
        let b = service.dispatch("echo", json!({"v": 2}), DispatchOptions::default()).await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.status, JobStatus::Queued);

        let record = wait_terminal(&service, a.job_id).await;
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.output, Some(json!({"v": 1})));
        assert_eq!(record.progress, 100);
        assert_eq!(record.logs.len(), 1);
        assert!(service.cache().get(&a.job_id).is_some());
    }

    #[tokio::test]
    async fn invalid_input_creates_no_record() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let service = JobService::builder(Arc::clone(&store))
            .workers(workers())
            .target(BoxDispatchTarget::new(CountingTarget {
                calls: Arc::clone(&calls),
                fail: false,
            }))
            .build();

        let err = service
            .dispatch("strict", json!("seven"), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));

        let err = service
            .dispatch("nope", json!({}), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownWorker(_)));

        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_mode_prefers_remote_target() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let service = JobService::builder(Arc::clone(&store))
            .workers(workers())
            .target(BoxDispatchTarget::new(CountingTarget {
                calls: Arc::clone(&calls),
                fail: false,
            }))
            .build();

        let receipt = service.dispatch("strict", json!(4), DispatchOptions::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Remote jobs stay queued until the backend picks them up.
        let record = store.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn failed_submission_marks_record_error() {
        let store = Arc::new(MemoryStore::new());
        let service = JobService::builder(Arc::clone(&store))
            .workers(workers())
            .target(BoxDispatchTarget::new(CountingTarget {
                calls: Arc::new(AtomicU32::new(0)),
                fail: true,
            }))
            .build();

        let err = service
            .dispatch("strict", json!(4), DispatchOptions::default())
            .await
            .unwrap_err();
        let DispatchError::Submission { job_id, .. } = err else {
            panic!("expected submission error, got {err:?}");
        };
        let record = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.error.unwrap().name.as_deref(), Some("DispatchError"));
    }

    #[tokio::test]
    async fn remote_mode_without_target_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let service = JobService::builder(Arc::clone(&store)).workers(workers()).build();
        let err = service
            .dispatch(
                "echo",
                json!({}),
                DispatchOptions {
                    mode: Some(DispatchMode::Remote),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoTarget));

        let err = service
            .dispatch(
                "echo",
                json!({}),
                DispatchOptions {
                    metadata: Some(json!([1, 2])),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidMetadata(_)));
    }

    #[tokio::test]
    async fn accepted_trigger_runs_the_job() {
        let store = Arc::new(MemoryStore::new());
        let service = JobService::builder(Arc::clone(&store)).workers(workers()).build();
        let job_id = Uuid::now_v7();

        let response = service
            .accept_trigger(TriggerBody {
                worker_id: "strict".to_string(),
                job_id,
                input: json!(21),
                context: json!({}),
                webhook_url: None,
                metadata: json!({"source": "test"}),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(response.job_id, job_id);

        let record = wait_terminal(&service, job_id).await;
        assert_eq!(record.output, Some(json!(42)));
        assert_eq!(record.metadata["source"], "test");
    }
}
