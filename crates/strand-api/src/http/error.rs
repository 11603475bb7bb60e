//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use strand_core::job::{DispatchError, QueueError};
use strand_core::workflow::{EngineError, SchedulerError};
use strand_infra::dispatch::WebhookError;
use strand_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    Scheduler(SchedulerError),
    Dispatch(DispatchError),
    Queue(QueueError),
    /// Callback signature rejected.
    Webhook(WebhookError),
    NotFound(String),
    Validation(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        AppError::Scheduler(e)
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        AppError::Dispatch(e)
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Queue(e)
    }
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        AppError::Webhook(e)
    }
}

type Classified = (StatusCode, &'static str, String);

fn storage(e: &RepositoryError) -> Classified {
    match e {
        RepositoryError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
        RepositoryError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string()),
    }
}

fn engine(e: &EngineError) -> Classified {
    match e {
        EngineError::UnknownWorkflow(_) => (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND", e.to_string()),
        EngineError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND", e.to_string()),
        EngineError::VersionMismatch { .. } => (StatusCode::CONFLICT, "VERSION_MISMATCH", e.to_string()),
        EngineError::NotClaimable { .. } => (StatusCode::CONFLICT, "INSTANCE_BUSY", e.to_string()),
        EngineError::AlreadyTerminal { .. } => (StatusCode::CONFLICT, "ALREADY_TERMINAL", e.to_string()),
        EngineError::WorkflowFailed { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "WORKFLOW_FAILED", e.to_string())
        }
        EngineError::Storage(inner) => storage(inner),
    }
}

fn scheduler(e: &SchedulerError) -> Classified {
    match e {
        SchedulerError::NoWaiter { .. } => (StatusCode::NOT_FOUND, "NO_WAITER", e.to_string()),
        SchedulerError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        SchedulerError::ReservedEvent(_) => (StatusCode::BAD_REQUEST, "RESERVED_EVENT", e.to_string()),
        SchedulerError::Engine(inner) => engine(inner),
        SchedulerError::Storage(inner) => storage(inner),
    }
}

fn dispatch(e: &DispatchError) -> Classified {
    match e {
        DispatchError::UnknownWorker(_) => (StatusCode::NOT_FOUND, "WORKER_NOT_FOUND", e.to_string()),
        DispatchError::Validation { .. } | DispatchError::InvalidMetadata(_) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
        }
        DispatchError::NoTarget => (StatusCode::SERVICE_UNAVAILABLE, "NO_TARGET", e.to_string()),
        DispatchError::Submission { .. } => (StatusCode::BAD_GATEWAY, "SUBMISSION_FAILED", e.to_string()),
        DispatchError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR", e.to_string()),
        DispatchError::Storage(inner) => storage(inner),
    }
}

fn queue(e: &QueueError) -> Classified {
    match e {
        QueueError::UnknownQueue(_) => (StatusCode::NOT_FOUND, "QUEUE_NOT_FOUND", e.to_string()),
        QueueError::InvalidConfig(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        QueueError::QueueJobNotFound(_) => (StatusCode::NOT_FOUND, "QUEUE_JOB_NOT_FOUND", e.to_string()),
        QueueError::Dispatch(inner) => dispatch(inner),
        QueueError::Storage(inner) => storage(inner),
    }
}

impl AppError {
    fn classify(&self) -> Classified {
        match self {
            AppError::Engine(e) => engine(e),
            AppError::Scheduler(e) => scheduler(e),
            AppError::Dispatch(e) => dispatch(e),
            AppError::Queue(e) => queue(e),
            AppError::Webhook(WebhookError::InvalidKey(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "WEBHOOK_ERROR", msg.clone())
            }
            AppError::Webhook(e) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", e.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
        }
    }

    /// HTTP status and machine-readable code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        let (status, code, _) = self.classify();
        (status, code)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.classify();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        let body = ApiResponse::error(code, &message, String::new(), 0);
        let body = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"data":null,"errors":[{"code":"SERIALIZATION_ERROR","message":"Failed to serialize response"}]}"#.to_string()
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
