//! Signal delivery handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use strand_core::workflow::{SignalDelivery, SignalRequest};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::handlers::{instance_link, to_json};
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub token: String,
    #[serde(default)]
    pub payload: Value,
}

/// POST /api/v1/signals - Deliver a named event to one waiting instance.
pub async fn send_signal(
    State(state): State<AppState>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let delivery = state.scheduler.send_signal(body).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    Ok(Json(
        ApiResponse::success(to_json(&delivery)?, request_id, elapsed)
            .with_link("instance", &instance_link(delivery.instance_id)),
    ))
}

/// POST /api/v1/signals/resume - Resume the instance waiting under a token.
///
/// Responds with the bare `{"status": "resumed"}` body, or `"pending"` when
/// another runner held the instance and the payload waits for its next
/// replay. A token nobody waits on is a 404 `NO_WAITER`.
pub async fn resume_by_token(
    State(state): State<AppState>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<Value>, AppError> {
    let delivery = state
        .scheduler
        .resume_by_token(&body.token, body.payload)
        .await?;
    Ok(Json(json!({
        "status": resume_status(&delivery),
        "instanceId": delivery.instance_id,
    })))
}

fn resume_status(delivery: &SignalDelivery) -> &'static str {
    if delivery.resumed { "resumed" } else { "pending" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use strand_types::workflow::InstanceStatus;

    #[tokio::test]
    async fn resume_by_token_completes_instance() {
        let (state, _tmp) = test_state().await;
        let (id, _) = state
            .engine
            .start("approval", json!({"document": "d", "token": "tok-1"}), None)
            .await
            .unwrap();

        let Json(body) = resume_by_token(
            State(state.clone()),
            Json(ResumeRequest {
                token: "tok-1".to_string(),
                payload: json!({"approved": false}),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["status"], "resumed");
        assert_eq!(body["instanceId"], id.to_string());

        let instance = state.engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.result.unwrap()["decision"]["approved"], false);
    }

    #[test]
    fn unclaimed_delivery_reports_pending() {
        let mut delivery = SignalDelivery {
            signal_id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            resumed: false,
            outcome: None,
        };
        assert_eq!(resume_status(&delivery), "pending");
        delivery.resumed = true;
        assert_eq!(resume_status(&delivery), "resumed");
    }

    #[tokio::test]
    async fn unknown_token_is_no_waiter() {
        let (state, _tmp) = test_state().await;
        let err = resume_by_token(
            State(state),
            Json(ResumeRequest {
                token: "missing".to_string(),
                payload: Value::Null,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.status_and_code(),
            (axum::http::StatusCode::NOT_FOUND, "NO_WAITER")
        );
    }

    #[tokio::test]
    async fn named_signal_reaches_oldest_waiter() {
        let (state, _tmp) = test_state().await;
        let (first, _) = state
            .engine
            .start("approval", json!({"document": 1}), None)
            .await
            .unwrap();
        let (second, _) = state
            .engine
            .start("approval", json!({"document": 2}), None)
            .await
            .unwrap();

        let Json(resp) = send_signal(
            State(state.clone()),
            Json(SignalRequest {
                event_name: "approve".to_string(),
                payload: json!({"approved": true}),
                token: None,
                instance_id: None,
            }),
        )
        .await
        .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["instance_id"], first.to_string());
        assert_eq!(data["resumed"], true);

        let pending = state.engine.get_instance(second).await.unwrap().unwrap();
        assert_eq!(pending.status, InstanceStatus::Suspended);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let (state, _tmp) = test_state().await;
        state
            .engine
            .start("approval", json!({"document": 1}), None)
            .await
            .unwrap();
        let err = send_signal(
            State(state),
            Json(SignalRequest {
                event_name: "approve".to_string(),
                payload: json!({"approved": "yes"}),
                token: None,
                instance_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_and_code().1, "VALIDATION_ERROR");
    }
}
