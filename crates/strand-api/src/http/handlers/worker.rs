//! Worker listing.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use strand_types::job::WorkerInfo;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/workers - Registered workers with their input schemas.
pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkerInfo>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let mut workers = state.jobs.workers().list();
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(workers, request_id, elapsed).with_link("self", "/api/v1/workers"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn workers_are_listed_with_schemas() {
        let (state, _tmp) = test_state().await;
        let Json(resp) = list_workers(State(state)).await.unwrap();
        let workers = resp.data.unwrap();
        let ids: Vec<&str> = workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["echo", "fail", "sum"]);

        let sum = workers.iter().find(|w| w.id == "sum").unwrap();
        assert!(sum.input_schema["properties"]["values"].is_object());
    }
}
