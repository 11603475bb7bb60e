//! Job dispatch and status handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use strand_types::job::{DispatchOptions, DispatchReceipt, JobRecord};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::query::JobListQuery;
use crate::http::handlers::to_json;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJobRequest {
    pub worker_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub options: DispatchOptions,
}

fn job_link(id: Uuid) -> String {
    format!("/api/v1/jobs/{id}")
}

/// POST /api/v1/jobs - Dispatch one worker invocation.
pub async fn dispatch_job(
    State(state): State<AppState>,
    Json(body): Json<DispatchJobRequest>,
) -> Result<Json<ApiResponse<DispatchReceipt>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let receipt = state
        .jobs
        .dispatch(&body.worker_id, body.input, body.options)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let link = job_link(receipt.job_id);
    Ok(Json(ApiResponse::success(receipt, request_id, elapsed).with_link("self", &link)))
}

/// GET /api/v1/jobs - List jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<ApiResponse<Vec<Value>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let jobs = state
        .jobs
        .list_jobs(query.worker_id.as_deref(), query.limit)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let data = jobs.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(
        ApiResponse::success(data, request_id, elapsed).with_link("self", "/api/v1/jobs"),
    ))
}

/// GET /api/v1/jobs/{id} - Job status in its wire format (not enveloped).
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, AppError> {
    state
        .jobs
        .get_job(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use strand_types::job::JobStatus;

    use crate::state::test_support::test_state;

    async fn wait_finished(state: &AppState, id: Uuid) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let Json(record) = get_job(State(state.clone()), Path(id)).await.unwrap();
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_runs_locally_and_reports_wire_format() {
        let (state, _tmp) = test_state().await;
        let Json(resp) = dispatch_job(
            State(state.clone()),
            Json(DispatchJobRequest {
                worker_id: "sum".to_string(),
                input: json!({"values": [2, 3]}),
                options: DispatchOptions::default(),
            }),
        )
        .await
        .unwrap();
        let receipt = resp.data.unwrap();
        assert_eq!(receipt.status, JobStatus::Queued);

        let record = wait_finished(&state, receipt.job_id).await;
        assert_eq!(record.status, JobStatus::Success);

        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["_id"], receipt.job_id.to_string());
        assert_eq!(wire["workerId"], "sum");
        assert_eq!(wire["progressPct"], 100);
        assert_eq!(wire["output"]["sum"], 5.0);
        assert!(wire["logs"].as_array().is_some_and(|logs| !logs.is_empty()));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_without_record() {
        let (state, _tmp) = test_state().await;
        let err = dispatch_job(
            State(state.clone()),
            Json(DispatchJobRequest {
                worker_id: "sum".to_string(),
                input: json!({"values": "nope"}),
                options: DispatchOptions::default(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_and_code().1, "VALIDATION_ERROR");

        let Json(resp) = list_jobs(State(state), Query(JobListQuery::default())).await.unwrap();
        assert!(resp.data.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (state, _tmp) = test_state().await;
        let err = get_job(State(state), Path(Uuid::now_v7())).await.unwrap_err();
        assert_eq!(err.status_and_code().1, "NOT_FOUND");
    }

    #[test]
    fn dispatch_request_flattens_options() {
        let body: DispatchJobRequest = serde_json::from_value(json!({
            "workerId": "echo",
            "input": {"a": 1},
            "mode": "local",
            "webhookUrl": "http://localhost/cb",
            "metadata": {"k": "v"}
        }))
        .unwrap();
        assert_eq!(body.worker_id, "echo");
        assert_eq!(body.options.webhook_url.as_deref(), Some("http://localhost/cb"));
        assert_eq!(body.options.metadata, Some(json!({"k": "v"})));
    }
}
