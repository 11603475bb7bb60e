//! HTTP request handlers for the REST API.

pub mod callback;
pub mod instance;
pub mod job;
pub mod queue;
pub mod signal;
pub mod trigger;
pub mod worker;
pub mod workflow;

use serde::Serialize;
use strand_core::workflow::{EngineError, WorkflowOutcome};
use uuid::Uuid;

use crate::http::error::AppError;

/// A failed run is reported as an outcome rather than an HTTP error.
pub(crate) fn settle(
    result: Result<WorkflowOutcome, EngineError>,
) -> Result<WorkflowOutcome, AppError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(EngineError::WorkflowFailed { message, .. }) => Ok(WorkflowOutcome::Failed { error: message }),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

pub(crate) fn instance_link(id: Uuid) -> String {
    format!("/api/v1/instances/{id}")
}
