//! Error types seen by workflow handlers and by engine callers.

use strand_types::error::RepositoryError;
use strand_types::workflow::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

/// Error type threaded through workflow handlers with `?`.
///
/// `Suspended` is not a failure: it unwinds the handler when an operation
/// has to wait for a timer or a signal, and the engine turns it into a
/// durable `Suspended` status. Handlers should propagate it untouched.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("suspended waiting for '{waiting_for}'")]
    Suspended {
        waiting_for: String,
        token: Option<String>,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step: String,
        message: String,
        attempts: u32,
    },

    #[error("non-deterministic replay at operation {op}: history has {recorded}, handler requested {requested}")]
    NonDeterministic {
        op: u32,
        recorded: String,
        requested: String,
    },

    #[error("{0}")]
    Failed(String),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl FlowError {
    pub fn failed(message: impl Into<String>) -> Self {
        FlowError::Failed(message.into())
    }

    pub fn is_suspension(&self) -> bool {
        matches!(self, FlowError::Suspended { .. })
    }
}

/// Errors returned by `Engine` and `Scheduler` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance {id} was started with version {recorded}, registered version is {registered}")]
    VersionMismatch {
        id: Uuid,
        recorded: String,
        registered: String,
    },

    /// Another runner owns the instance, or its status does not allow it.
    #[error("instance {id} cannot be claimed from status {status}")]
    NotClaimable { id: Uuid, status: InstanceStatus },

    #[error("instance {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: InstanceStatus },

    /// The handler returned an error; the instance is now `Failed`.
    #[error("instance {instance_id} failed: {message}")]
    WorkflowFailed { instance_id: Uuid, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}
