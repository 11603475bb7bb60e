//! Background tasks run alongside the HTTP server.
//!
//! - the timer sweeper, firing due sleeps and wait timeouts
//! - the job signal bridge, resuming workflows waiting on `job:<jobId>`

use std::time::Duration;

use serde_json::Value;
use strand_core::job::JobService;
use strand_core::repository::job::JobStore;
use strand_core::repository::workflow::WorkflowStore;
use strand_core::workflow::{Scheduler, SchedulerError, SignalDelivery, SignalRequest};
use strand_types::config::EngineConfig;
use strand_types::event::EngineEvent;
use strand_types::job::{JobRecord, WebhookCallback};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builtins::WORKFLOW_INSTANCE_KEY;

/// Signal name a workflow waits on for the completion of `job_id`.
pub fn job_event_name(job_id: Uuid) -> String {
    format!("job:{job_id}")
}

pub fn spawn_timer_sweeper<S: WorkflowStore + 'static>(
    scheduler: Scheduler<S>,
    config: &EngineConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_millis(config.timer_sweep_interval_ms.max(1));
    let batch_size = config.timer_batch_size;
    let stale_after = Duration::from_secs(config.recover_after_secs);
    tokio::spawn(scheduler.run_sweeper(interval, batch_size, stale_after, shutdown))
}

/// Deliver a finished job's callback to the workflow waiting on it.
///
/// The waiter is the instance named in the job's `workflowInstanceId`
/// metadata, else the oldest instance waiting on `job:<jobId>`. Returns
/// `Ok(None)` when nothing is waiting.
pub async fn deliver_job_callback<S: WorkflowStore + 'static>(
    scheduler: &Scheduler<S>,
    callback: &WebhookCallback,
) -> Result<Option<SignalDelivery>, SchedulerError> {
    let instance_id = callback
        .metadata
        .as_ref()
        .and_then(|m| m.get(WORKFLOW_INSTANCE_KEY))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Uuid>().ok());
    let payload = serde_json::to_value(callback)
        .map_err(|e| SchedulerError::Validation(format!("unserializable callback: {e}")))?;

    let request = SignalRequest {
        event_name: job_event_name(callback.job_id),
        payload,
        token: None,
        instance_id,
    };
    match scheduler.send_signal(request).await {
        Ok(delivery) => Ok(Some(delivery)),
        Err(SchedulerError::NoWaiter { .. }) => {
            tracing::debug!(job_id = %callback.job_id, "no workflow waiting on job");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn callback_for(record: &JobRecord) -> WebhookCallback {
    WebhookCallback {
        job_id: record.id,
        worker_id: record.worker_id.clone(),
        status: record.status,
        output: record.output.clone(),
        error: record.error.clone(),
        metadata: Some(record.metadata.clone()),
    }
}

/// Forward `JobFinished` events from the bus to waiting workflows.
pub fn spawn_job_signal_bridge<S, J>(
    jobs: JobService<J>,
    scheduler: Scheduler<S>,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: WorkflowStore + 'static,
    J: JobStore + 'static,
{
    let mut events = jobs.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(EngineEvent::JobFinished { job_id, .. }) => {
                        let jobs = jobs.clone();
                        let scheduler = scheduler.clone();
                        tokio::spawn(async move {
                            bridge_job(&jobs, &scheduler, job_id).await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "job signal bridge lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("job signal bridge stopped");
    })
}

async fn bridge_job<S, J>(jobs: &JobService<J>, scheduler: &Scheduler<S>, job_id: Uuid)
where
    S: WorkflowStore + 'static,
    J: JobStore + 'static,
{
    let record = match jobs.get_job(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "failed to load finished job");
            return;
        }
    };
    match deliver_job_callback(scheduler, &callback_for(&record)).await {
        Ok(Some(delivery)) => {
            tracing::info!(
                job_id = %job_id,
                instance_id = %delivery.instance_id,
                resumed = delivery.resumed,
                "job completion delivered to workflow"
            );
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "job completion signal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::workflow::WorkflowOutcome;
    use strand_types::job::JobStatus;
    use strand_types::workflow::InstanceStatus;

    use crate::state::test_support::test_state;

    #[test]
    fn job_event_names() {
        assert_eq!(job_event_name(Uuid::nil()), "job:00000000-0000-0000-0000-000000000000");
    }

    #[tokio::test]
    async fn callback_without_waiter_is_ignored() {
        let (state, _tmp) = test_state().await;
        let callback = WebhookCallback {
            job_id: Uuid::now_v7(),
            worker_id: "echo".to_string(),
            status: JobStatus::Success,
            output: None,
            error: None,
            metadata: None,
        };
        let delivery = deliver_job_callback(&state.scheduler, &callback).await.unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn bridge_completes_run_job_workflow() {
        let (state, _tmp) = test_state().await;
        let shutdown = CancellationToken::new();
        let bridge = spawn_job_signal_bridge(state.jobs.clone(), state.scheduler.clone(), shutdown.clone());

        let (id, outcome) = state
            .engine
            .start("run-job", json!({"workerId": "echo", "input": {"hello": "world"}}), None)
            .await
            .unwrap();
        // The echo job may already have finished; either way the instance
        // ends up completed once the bridge delivers its signal.
        if let WorkflowOutcome::Suspended { waiting_for, .. } = &outcome {
            assert!(waiting_for.starts_with("job:"));
        }

        let instance = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let instance = state.engine.get_instance(id).await.unwrap().unwrap();
                if instance.status == InstanceStatus::Completed {
                    return instance;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let result = instance.result.unwrap();
        assert_eq!(result["callback"]["status"], "success");
        assert_eq!(result["callback"]["output"], json!({"hello": "world"}));

        shutdown.cancel();
        bridge.await.unwrap();
    }
}
