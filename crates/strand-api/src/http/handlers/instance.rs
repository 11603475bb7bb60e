//! Workflow instance handlers: inspection, resume, cancel and replay checks.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use strand_core::workflow::EngineError;
use strand_types::workflow::InstanceStatus;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::query::InstanceListQuery;
use crate::http::handlers::{instance_link, settle, to_json};
use crate::http::response::ApiResponse;
use crate::state::AppState;

const DEFAULT_CANCEL_REASON: &str = "cancelled via API";

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// GET /api/v1/instances - List instances, newest first.
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceListQuery>,
) -> Result<Json<ApiResponse<Vec<Value>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let status = match &query.status {
        Some(s) => Some(s.parse::<InstanceStatus>().map_err(AppError::Validation)?),
        None => None,
    };
    let instances = state.engine.list_instances(status, query.limit).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = instances.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed).with_link("self", "/api/v1/instances"),
    ))
}

/// GET /api/v1/instances/{id} - Instance state with its event history.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let instance = state
        .engine
        .get_instance(id)
        .await?
        .ok_or(EngineError::InstanceNotFound(id))?;
    let history = state.engine.history(id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = json!({
        "instance": to_json(&instance)?,
        "history": to_json(&history)?,
    });
    let self_link = instance_link(id);
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed)
            .with_link("self", &self_link)
            .with_link("replay", &format!("{self_link}/replay")),
    ))
}

/// POST /api/v1/instances/{id}/resume - Re-execute a suspended instance.
pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let outcome = settle(state.engine.resume(id).await)?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = json!({"instanceId": id, "outcome": outcome});
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed).with_link("self", &instance_link(id)),
    ))
}

/// POST /api/v1/instances/{id}/cancel - Cancel, or request cancellation of a running instance.
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let reason = body.reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON);
    let outcome = state.engine.cancel(id, reason).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = json!({"instanceId": id, "cancel": outcome, "reason": reason});
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed).with_link("self", &instance_link(id)),
    ))
}

/// GET /api/v1/instances/{id}/replay - Replay history and compare with the recorded outcome.
pub async fn verify_replay(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let report = state.engine.verify_replay(id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(to_json(&report)?, request_id, elapsed)
            .with_link("instance", &instance_link(id)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::extractors::query::InstanceListQuery;
    use crate::state::test_support::test_state;

    async fn suspended_approval(state: &AppState) -> Uuid {
        let (id, _) = state
            .engine
            .start("approval", json!({"document": "d"}), None)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn get_includes_history() {
        let (state, _tmp) = test_state().await;
        let id = suspended_approval(&state).await;

        let Json(resp) = get_instance(State(state), Path(id)).await.unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["instance"]["status"], "suspended");
        let history = data["history"].as_array().unwrap();
        assert!(history.len() >= 2);
        assert_eq!(history[0]["sequence"], 1);
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let (state, _tmp) = test_state().await;
        let err = get_instance(State(state), Path(Uuid::now_v7())).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "INSTANCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (state, _tmp) = test_state().await;
        suspended_approval(&state).await;

        let Json(resp) = list_instances(
            State(state.clone()),
            Query(InstanceListQuery {
                status: Some("suspended".to_string()),
                ..InstanceListQuery::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().len(), 1);

        let Json(resp) = list_instances(
            State(state.clone()),
            Query(InstanceListQuery {
                status: Some("completed".to_string()),
                ..InstanceListQuery::default()
            }),
        )
        .await
        .unwrap();
        assert!(resp.data.unwrap().is_empty());

        let err = list_instances(
            State(state),
            Query(InstanceListQuery {
                status: Some("sleeping".to_string()),
                ..InstanceListQuery::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_and_code().1, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn cancel_then_cancel_again_conflicts() {
        let (state, _tmp) = test_state().await;
        let id = suspended_approval(&state).await;

        let Json(resp) = cancel_instance(
            State(state.clone()),
            Path(id),
            Json(CancelRequest { reason: Some("no longer needed".to_string()) }),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap()["cancel"], "cancelled");

        let instance = state.engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);

        let err = cancel_instance(State(state), Path(id), Json(CancelRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "ALREADY_TERMINAL");
    }

    #[tokio::test]
    async fn resume_keeps_waiting_without_signal() {
        let (state, _tmp) = test_state().await;
        let id = suspended_approval(&state).await;

        let Json(resp) = resume_instance(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(resp.data.unwrap()["outcome"]["status"], "suspended");

        let Json(resp) = verify_replay(State(state), Path(id)).await.unwrap();
        assert_eq!(resp.data.unwrap()["matches"], true);
    }
}
