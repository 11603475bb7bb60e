use strand_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously by `JobService::dispatch`.
///
/// Everything except `Submission` is raised before a job record exists.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("invalid input for worker '{worker_id}': {message}")]
    Validation { worker_id: String, message: String },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("remote dispatch requested but no trigger endpoint is configured")]
    NoTarget,

    /// The record was created and has been marked `error`.
    #[error("submission of job {job_id} failed: {message}")]
    Submission { job_id: Uuid, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("invalid queue config: {0}")]
    InvalidConfig(String),

    #[error("queue job not found: {0}")]
    QueueJobNotFound(Uuid),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}
