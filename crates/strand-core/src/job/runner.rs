//! Worker-side execution of a single job.

use std::sync::Arc;

use strand_types::event::EngineEvent;
use strand_types::job::{JobError, JobRecord, WebhookCallback};
use uuid::Uuid;

use super::JobService;
use super::error::DispatchError;
use super::worker::JobContext;
use crate::repository::job::JobStore;

impl<J: JobStore + 'static> JobService<J> {
    /// Execute a queued job to a terminal status.
    ///
    /// Worker failures are recorded on the job, not returned; the error
    /// path only covers storage failures and jobs that are not `queued`.
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobRecord, DispatchError> {
        let record = self.inner.store.mark_running(&job_id).await?;
        tracing::info!(job_id = %job_id, worker_id = %record.worker_id, "job started");

        let result = match self.inner.workers.get(&record.worker_id) {
            Some(worker) => {
                let ctx = JobContext::new(Arc::clone(&self.inner.store), job_id);
                worker.run(record.input.clone(), ctx).await
            }
            None => Err(JobError::named(
                "UnknownWorker",
                format!("worker '{}' is not registered here", record.worker_id),
            )),
        };

        let finished = match result {
            Ok(output) => self.inner.store.complete_job(&job_id, &output).await?,
            Err(error) => {
                tracing::warn!(job_id = %job_id, error = %error.message, "job failed");
                self.inner.store.fail_job(&job_id, &error).await?
            }
        };
        self.finished(finished.clone()).await;
        Ok(finished)
    }

    /// Post-completion bookkeeping: cache, event, webhook, queue chaining.
    pub(crate) async fn finished(&self, record: JobRecord) {
        tracing::info!(
            job_id = %record.id,
            worker_id = %record.worker_id,
            status = %record.status,
            "job finished"
        );
        self.inner.cache.insert(&record);
        self.inner.bus.publish(EngineEvent::JobFinished {
            job_id: record.id,
            worker_id: record.worker_id.clone(),
            status: record.status,
        });

        if let Some(url) = record.webhook_url.as_deref() {
            match &self.inner.notifier {
                Some(notifier) => {
                    let callback = WebhookCallback::from_record(&record);
                    if let Err(e) = notifier.notify(url, &callback).await {
                        tracing::warn!(job_id = %record.id, url, error = %e, "webhook delivery failed");
                    }
                }
                None => {
                    tracing::debug!(job_id = %record.id, url, "no webhook notifier configured");
                }
            }
        }

        if let Some(queue_context) = record.queue_context() {
            if let Err(e) = self.on_step_finished(&record, queue_context).await {
                tracing::error!(job_id = %record.id, error = %e, "queue advance failed");
            }
        }
    }
}
