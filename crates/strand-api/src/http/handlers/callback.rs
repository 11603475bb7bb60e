//! Job completion callbacks from remote workers.

use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use strand_infra::dispatch::SIGNATURE_HEADER;
use strand_types::job::WebhookCallback;
use uuid::Uuid;

use crate::background::deliver_job_callback;
use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/callbacks/jobs - Receive a signed job callback.
///
/// The signature covers the raw body. A verified callback is delivered as
/// signal `job:<jobId>`; no waiting instance is not an error.
pub async fn receive_job_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.verifier.verify(&body, signature) {
        tracing::warn!(error = %e, "rejected job callback");
        return Err(e.into());
    }

    let callback: WebhookCallback = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid callback body: {e}")))?;
    let delivery = deliver_job_callback(&state.scheduler, &callback).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = json!({
        "received": true,
        "jobId": callback.job_id,
        "delivered": delivery.is_some(),
        "instanceId": delivery.map(|d| d.instance_id),
    });
    Ok(Json(ApiResponse::success(data, request_id, elapsed)))
}
