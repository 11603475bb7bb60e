//! Queue registration, dispatch and run status.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::Value;
use strand_core::job::QueueError;
use strand_types::job::DispatchOptions;
use strand_types::queue::{QueueConfig, QueueDispatchReceipt, QueueJob};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct QueueDispatchRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub options: DispatchOptions,
}

fn queue_job_link(id: Uuid) -> String {
    format!("/api/v1/queue-jobs/{id}")
}

/// POST /api/v1/queues - Register (or replace) a queue definition.
pub async fn register_queue(
    State(state): State<AppState>,
    Json(config): Json<QueueConfig>,
) -> Result<Json<ApiResponse<QueueConfig>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.jobs.register_queue(config.clone())?;
    let elapsed = start.elapsed().as_millis() as u64;

    let link = format!("/api/v1/queues/{}/dispatch", config.id);
    Ok(Json(ApiResponse::success(config, request_id, elapsed).with_link("dispatch", &link)))
}

/// GET /api/v1/queues - Registered queue definitions.
pub async fn list_queues(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<QueueConfig>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let mut queues: Vec<QueueConfig> = state
        .jobs
        .queues()
        .list()
        .iter()
        .map(|q| q.as_ref().clone())
        .collect();
    queues.sort_by(|a, b| a.id.cmp(&b.id));
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(queues, request_id, elapsed).with_link("self", "/api/v1/queues"),
    ))
}

/// POST /api/v1/queues/{id}/dispatch - Start a queue run.
pub async fn dispatch_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
    Json(body): Json<QueueDispatchRequest>,
) -> Result<Json<ApiResponse<QueueDispatchReceipt>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let receipt = state
        .jobs
        .dispatch_queue(&queue_id, body.input, body.options)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let link = queue_job_link(receipt.queue_job_id);
    Ok(Json(
        ApiResponse::success(receipt, request_id, elapsed).with_link("queue_job", &link),
    ))
}

/// GET /api/v1/queue-jobs/{id} - Aggregate status of one queue run.
pub async fn get_queue_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<QueueJob>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let queue_job = state
        .jobs
        .get_queue_job(id)
        .await?
        .ok_or(QueueError::QueueJobNotFound(id))?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(queue_job, request_id, elapsed).with_link("self", &queue_job_link(id)),
    ))
}
