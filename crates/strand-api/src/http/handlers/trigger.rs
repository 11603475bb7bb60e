//! Worker-side trigger endpoint.
//!
//! Lets a `strand` host act as the remote execution backend of another (or
//! of itself, with `dispatch.trigger_url` pointing back at this server).

use axum::Json;
use axum::extract::State;
use strand_types::job::{TriggerRequest, TriggerResponse};

use crate::http::error::AppError;
use crate::state::AppState;

/// POST /workers/trigger - Accept a job and run it on a local worker.
///
/// Request and response use the trigger wire format and are not enveloped.
pub async fn trigger_worker(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    if request.worker_id != request.body.worker_id {
        return Err(AppError::Validation(format!(
            "workerId '{}' does not match body.workerId '{}'",
            request.worker_id, request.body.worker_id
        )));
    }
    let response = state.jobs.accept_trigger(request.body).await?;
    tracing::debug!(job_id = %response.job_id, "trigger accepted");
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use strand_types::job::{JobStatus, TriggerBody};
    use uuid::Uuid;

    use crate::state::test_support::test_state;

    fn request(worker_id: &str, job_id: Uuid) -> TriggerRequest {
        TriggerRequest {
            worker_id: worker_id.to_string(),
            body: TriggerBody {
                worker_id: worker_id.to_string(),
                job_id,
                input: json!({"ping": true}),
                context: json!({"origin": "test"}),
                webhook_url: None,
                metadata: json!({}),
                timestamp: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn trigger_creates_and_runs_job() {
        let (state, _tmp) = test_state().await;
        let job_id = Uuid::now_v7();
        let Json(response) = trigger_worker(State(state.clone()), Json(request("echo", job_id)))
            .await
            .unwrap();
        assert_eq!(response.job_id, job_id);
        assert!(!response.message_id.is_empty());

        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = state.jobs.get_job(job_id).await.unwrap().unwrap();
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.output, Some(json!({"ping": true})));
    }

    #[tokio::test]
    async fn mismatched_worker_ids_are_rejected() {
        let (state, _tmp) = test_state().await;
        let mut req = request("echo", Uuid::now_v7());
        req.worker_id = "sum".to_string();
        let err = trigger_worker(State(state), Json(req)).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let (state, _tmp) = test_state().await;
        let err = trigger_worker(State(state), Json(request("ghost", Uuid::now_v7())))
            .await
            .unwrap_err();
        assert_eq!(err.status_and_code().1, "WORKER_NOT_FOUND");
    }
}
