//! Engine event types for the Strand event bus.
//!
//! `EngineEvent` is broadcast as instances and jobs change state. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;
use crate::queue::QueueJobStatus;

/// Lifecycle events emitted by the engine, dispatcher and queue chainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow_id: String,
    },

    /// The instance parked on a timer or an external event.
    InstanceSuspended {
        instance_id: Uuid,
        waiting_for: String,
    },

    InstanceCompleted { instance_id: Uuid },

    InstanceFailed { instance_id: Uuid, error: String },

    InstanceCancelled { instance_id: Uuid, reason: String },

    StepCompleted {
        instance_id: Uuid,
        step: String,
        attempts: u32,
    },

    StepFailed {
        instance_id: Uuid,
        step: String,
        error: String,
        attempts: u32,
    },

    JobQueued { job_id: Uuid, worker_id: String },

    JobFinished {
        job_id: Uuid,
        worker_id: String,
        status: JobStatus,
    },

    QueueFinished {
        queue_job_id: Uuid,
        queue_id: String,
        status: QueueJobStatus,
    },
}

impl EngineEvent {
    /// Instance the event belongs to, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::InstanceSuspended { instance_id, .. }
            | EngineEvent::InstanceCompleted { instance_id }
            | EngineEvent::InstanceFailed { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. } => Some(*instance_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_event_is_tagged() {
        let event = EngineEvent::InstanceSuspended {
            instance_id: Uuid::nil(),
            waiting_for: "approve".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "instance_suspended");
        assert_eq!(json["waiting_for"], "approve");
        assert_eq!(event.instance_id(), Some(Uuid::nil()));

        let job = EngineEvent::JobQueued {
            job_id: Uuid::nil(),
            worker_id: "echo".to_string(),
        };
        assert_eq!(job.instance_id(), None);
    }
}
