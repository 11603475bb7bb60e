//! Workers and workflows registered by the `strand` host at startup.
//!
//! Workers:
//! - `echo` -- returns its input unchanged
//! - `sum` -- adds a list of numbers, reporting progress per item
//! - `fail` -- always fails with the given message
//!
//! Workflows:
//! - `approval` -- prepares a document, then waits for an `approve` signal
//!   (optionally correlated by token, with a timeout)
//! - `run-job` -- dispatches a worker job and waits for its completion
//!   signal `job:<jobId>`

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use strand_core::job::{JobService, Worker, WorkerRegistry};
use strand_core::repository::job::JobStore;
use strand_core::repository::workflow::WorkflowStore;
use strand_core::workflow::{FlowError, WaitOptions, WorkflowDefinition, WorkflowRegistry};
use strand_types::job::{DispatchOptions, JobError};
use uuid::Uuid;

/// Job metadata key linking a job to the workflow instance waiting on it.
pub const WORKFLOW_INSTANCE_KEY: &str = "workflowInstanceId";

const DEFAULT_APPROVAL_TIMEOUT: &str = "1h";

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
struct SumInput {
    values: Vec<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FailInput {
    #[serde(default)]
    message: Option<String>,
}

pub fn register_workers<J: JobStore + 'static>(workers: &WorkerRegistry<J>) {
    workers.register(
        Worker::new("echo", |input: Value, _ctx| async move { Ok(input) })
            .with_description("Returns its input unchanged"),
    );

    workers.register(
        Worker::new("sum", |input: SumInput, ctx| async move {
            let total = input.values.len().max(1) as i64;
            let mut sum = 0.0;
            for (i, value) in input.values.iter().enumerate() {
                sum += value;
                ctx.progress((i as i64 + 1) * 100 / total)
                    .await
                    .map_err(|e| JobError::new(e.to_string()))?;
            }
            ctx.log(format!("summed {} values", input.values.len()))
                .await
                .map_err(|e| JobError::new(e.to_string()))?;
            Ok(json!({"sum": sum, "count": input.values.len()}))
        })
        .with_description("Adds a list of numbers"),
    );

    workers.register(
        Worker::new("fail", |input: FailInput, _ctx| async move {
            Err::<Value, _>(JobError::named(
                "RequestedFailure",
                input.message.unwrap_or_else(|| "failed on request".to_string()),
            ))
        })
        .with_description("Always fails; useful for exercising queue failure policies"),
    );
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalInput {
    #[serde(default)]
    document: Value,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunJobInput {
    worker_id: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    timeout: Option<String>,
}

fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, FlowError> {
    serde_json::from_value(input).map_err(|e| FlowError::failed(format!("invalid input: {e}")))
}

fn validate_approval(payload: &Value) -> Result<(), String> {
    match payload.get("approved") {
        Some(Value::Bool(_)) => Ok(()),
        _ => Err("approve payload must contain a boolean 'approved'".to_string()),
    }
}

pub fn register_workflows<S, J>(registry: &WorkflowRegistry<S>, jobs: &JobService<J>)
where
    S: WorkflowStore + 'static,
    J: JobStore + 'static,
{
    registry.register(
        WorkflowDefinition::new("approval", "1", |ctx, input| async move {
            let input: ApprovalInput = parse_input(input)?;
            let document = input.document.clone();
            let prepared: Value = ctx
                .step("prepare", || {
                    let document = document.clone();
                    async move {
                        Ok::<_, String>(json!({
                            "document": document,
                            "preparedAt": chrono::Utc::now(),
                        }))
                    }
                })
                .await?;

            let mut options = WaitOptions::new().timeout(
                input
                    .timeout
                    .unwrap_or_else(|| DEFAULT_APPROVAL_TIMEOUT.to_string()),
            );
            if let Some(token) = input.token {
                options = options.token(token);
            }
            let decision = ctx.wait_for_event("approve", options).await?;
            Ok(json!({"prepared": prepared, "decision": decision}))
        })
        .with_event_schema("approve", validate_approval),
    );

    let jobs = jobs.clone();
    registry.register(WorkflowDefinition::new("run-job", "1", move |ctx, input| {
        let jobs = jobs.clone();
        async move {
            let input: RunJobInput = parse_input(input)?;
            let instance_id = ctx.instance_id();

            let job_id: Uuid = ctx
                .step("dispatch", || {
                    let jobs = jobs.clone();
                    let worker_id = input.worker_id.clone();
                    let job_input = input.input.clone();
                    async move {
                        let mut metadata = Map::new();
                        metadata.insert(
                            WORKFLOW_INSTANCE_KEY.to_string(),
                            Value::String(instance_id.to_string()),
                        );
                        let options = DispatchOptions {
                            metadata: Some(Value::Object(metadata)),
                            ..DispatchOptions::default()
                        };
                        jobs.dispatch(&worker_id, job_input, options)
                            .await
                            .map(|receipt| receipt.job_id)
                    }
                })
                .await?;

            let mut options = WaitOptions::new();
            if let Some(timeout) = input.timeout {
                options = options.timeout(timeout);
            }
            let callback = ctx
                .wait_for_event(&format!("job:{job_id}"), options)
                .await?;
            Ok(json!({"jobId": job_id, "callback": callback}))
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use strand_core::event::EventBus;
    use strand_core::storage::memory::MemoryStore;
    use strand_core::workflow::{Engine, Scheduler, SignalRequest, WorkflowOutcome};
    use strand_types::job::JobStatus;

    fn services() -> (Scheduler<MemoryStore>, JobService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let workers = WorkerRegistry::new();
        register_workers(&workers);
        let jobs = JobService::builder(Arc::clone(&store))
            .workers(workers)
            .event_bus(bus.clone())
            .build();
        let registry = WorkflowRegistry::new();
        register_workflows(&registry, &jobs);
        let scheduler = Scheduler::new(Engine::new(store, registry, bus));
        (scheduler, jobs)
    }

    #[tokio::test]
    async fn approval_waits_for_valid_signal() {
        let (scheduler, _) = services();
        let engine = scheduler.engine();
        let (id, outcome) = engine
            .start("approval", json!({"document": {"title": "Q3"}, "token": "doc-q3"}), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WorkflowOutcome::Suspended { ref waiting_for, .. } if waiting_for == "approve"
        ));

        let rejected = scheduler
            .resume_by_token("doc-q3", json!({"ok": true}))
            .await;
        assert!(rejected.is_err());

        let delivery = scheduler
            .resume_by_token("doc-q3", json!({"approved": true}))
            .await
            .unwrap();
        match delivery.outcome.unwrap() {
            WorkflowOutcome::Completed { result } => {
                assert_eq!(result["decision"], json!({"approved": true}));
                assert_eq!(result["prepared"]["document"]["title"], "Q3");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert!(instance.status.is_terminal());
    }

    #[tokio::test]
    async fn run_job_resumes_on_job_signal() {
        let (scheduler, jobs) = services();
        let mut events = jobs.event_bus().subscribe();
        let (id, outcome) = scheduler
            .engine()
            .start("run-job", json!({"workerId": "sum", "input": {"values": [1, 2, 3]}}), None)
            .await
            .unwrap();
        let WorkflowOutcome::Suspended { waiting_for, .. } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        let job_id: Uuid = waiting_for.trim_start_matches("job:").parse().unwrap();

        // Wait for the local worker to finish.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(strand_types::event::EngineEvent::JobFinished { job_id: finished, .. }) =
                    events.recv().await
                {
                    if finished == job_id {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let record = jobs.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.output, Some(json!({"sum": 6.0, "count": 3})));
        assert_eq!(record.progress, 100);
        assert_eq!(record.metadata[WORKFLOW_INSTANCE_KEY], id.to_string());

        let delivery = scheduler
            .send_signal(SignalRequest {
                event_name: waiting_for,
                payload: json!({"status": "success", "output": record.output}),
                token: None,
                instance_id: Some(id),
            })
            .await
            .unwrap();
        match delivery.outcome.unwrap() {
            WorkflowOutcome::Completed { result } => {
                assert_eq!(result["jobId"], job_id.to_string());
                assert_eq!(result["callback"]["output"]["sum"], 6.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_worker_records_named_error() {
        let (_, jobs) = services();
        let mut events = jobs.event_bus().subscribe();
        let receipt = jobs
            .dispatch("fail", json!({"message": "nope"}), DispatchOptions::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(
                events.recv().await,
                Ok(strand_types::event::EngineEvent::JobFinished { .. })
            ) {}
        })
        .await
        .unwrap();

        let record = jobs.get_job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        let error = record.error.unwrap();
        assert_eq!(error.name.as_deref(), Some("RequestedFailure"));
        assert_eq!(error.message, "nope");
    }
}
