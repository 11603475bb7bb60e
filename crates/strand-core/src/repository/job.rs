//! Job store trait definition.
//!
//! Persisted job records and queue runs. A job record is mutated only by the
//! worker executing it, and only until it reaches a terminal status; every
//! mutation of a terminal record fails with `RepositoryError::Conflict`.

use serde_json::Value;
use strand_types::error::RepositoryError;
use strand_types::job::{JobError, JobRecord};
use strand_types::queue::{QueueJob, QueueJobStatus, QueueStepStatus};
use uuid::Uuid;

/// Storage trait for job records and queue jobs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Job records
    // -----------------------------------------------------------------------

    /// Insert a new record. Fails with `Conflict` if the ID exists.
    fn create_job(
        &self,
        job: &JobRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobRecord>, RepositoryError>> + Send;

    /// List records newest first, optionally for one worker.
    fn list_jobs(
        &self,
        worker_id: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<JobRecord>, RepositoryError>> + Send;

    /// `queued -> running`, stamping `started_at`. Returns the updated record.
    fn mark_running(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<JobRecord, RepositoryError>> + Send;

    /// Set progress (already clamped to 0..=100 by the caller).
    fn update_progress(
        &self,
        id: &Uuid,
        progress: u8,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn append_log(
        &self,
        id: &Uuid,
        message: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Terminal success: stores the output, sets progress to 100.
    fn complete_job(
        &self,
        id: &Uuid,
        output: &Value,
    ) -> impl std::future::Future<Output = Result<JobRecord, RepositoryError>> + Send;

    /// Terminal failure.
    fn fail_job(
        &self,
        id: &Uuid,
        error: &JobError,
    ) -> impl std::future::Future<Output = Result<JobRecord, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Queue jobs
    // -----------------------------------------------------------------------

    fn create_queue_job(
        &self,
        queue_job: &QueueJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_queue_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<QueueJob>, RepositoryError>> + Send;

    /// Record the job and state of step `index`.
    ///
    /// `Dispatched` never replaces a finished step status; the step's job can
    /// finish before its dispatcher records it.
    fn update_queue_step(
        &self,
        id: &Uuid,
        index: usize,
        job_id: Option<Uuid>,
        status: QueueStepStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set the aggregate status; terminal statuses stamp `finished_at`.
    fn set_queue_job_status(
        &self,
        id: &Uuid,
        status: QueueJobStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Reject mutation of a record that already reached a terminal status.
pub fn ensure_mutable(job: &JobRecord) -> Result<(), RepositoryError> {
    if job.status.is_terminal() {
        return Err(RepositoryError::Conflict(format!(
            "job {} is already {}",
            job.id, job.status
        )));
    }
    Ok(())
}
