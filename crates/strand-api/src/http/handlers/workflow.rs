//! Workflow definition handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};
use strand_core::workflow::{EngineError, WorkflowOutcome};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::handlers::instance_link;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub input: Value,
    /// Caller-chosen instance id; starting an existing id resumes it.
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

/// GET /api/v1/workflows - List registered workflow definitions.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Value>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflows = state
        .engine
        .registry()
        .list()
        .into_iter()
        .map(|(id, version)| json!({"id": id, "version": version}))
        .collect();
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(workflows, request_id, elapsed).with_link("self", "/api/v1/workflows"),
    ))
}

/// POST /api/v1/workflows/{id}/start - Start an instance and run it to its first suspension.
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(body): Json<StartWorkflowRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let (instance_id, outcome) = match state
        .engine
        .start(&workflow_id, body.input, body.instance_id)
        .await
    {
        Ok(started) => started,
        Err(EngineError::WorkflowFailed { instance_id, message }) => {
            (instance_id, WorkflowOutcome::Failed { error: message })
        }
        Err(e) => return Err(e.into()),
    };
    let elapsed = start.elapsed().as_millis() as u64;

    let data = json!({
        "instanceId": instance_id,
        "workflowId": workflow_id,
        "outcome": outcome,
    });
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed).with_link("self", &instance_link(instance_id)),
    ))
}
