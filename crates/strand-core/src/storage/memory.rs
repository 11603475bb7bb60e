//! In-memory storage driver.
//!
//! Implements both [`WorkflowStore`] and [`JobStore`] on top of `DashMap`
//! tables. Per-instance atomicity comes from DashMap's per-entry locking:
//! a claim or an append holds the entry for the duration of its check and
//! write. Nothing survives the process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use strand_types::error::RepositoryError;
use strand_types::job::{JobError, JobLog, JobRecord, JobStatus};
use strand_types::queue::{QueueJob, QueueJobStatus, QueueStepStatus};
use strand_types::workflow::{
    HistoryEvent, InstanceStatus, Signal, StatusUpdate, Timer, WorkflowInstance,
};
use uuid::Uuid;

use crate::repository::job::{JobStore, ensure_mutable};
use crate::repository::workflow::{WorkflowStore, check_append_sequence};

/// Process-local store for workflows and jobs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: DashMap<Uuid, WorkflowInstance>,
    events: DashMap<Uuid, Vec<HistoryEvent>>,
    signals: DashMap<Uuid, Signal>,
    timers: DashMap<Uuid, Timer>,
    jobs: DashMap<Uuid, JobRecord>,
    queue_jobs: DashMap<Uuid, QueueJob>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

impl WorkflowStore for MemoryStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        if self.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|i| i.clone()))
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut list: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .map(|i| i.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit as usize);
        Ok(list)
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        update: &StatusUpdate,
    ) -> Result<(), RepositoryError> {
        let mut instance = self.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        instance.status = status;
        instance.updated_at = now;
        instance.waiting_for_event = update.waiting_for_event.clone();
        instance.wait_token = update.wait_token.clone();
        if let Some(result) = &update.result {
            instance.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            instance.error = Some(error.clone());
        }
        if let Some(reason) = &update.cancel_reason {
            instance.cancel_reason = Some(reason.clone());
        }
        if status.is_terminal() {
            instance.completed_at = Some(now);
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<bool, RepositoryError> {
        let Some(mut instance) = self.instances.get_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&instance.status) {
            return Ok(false);
        }
        instance.status = to;
        instance.updated_at = Utc::now();
        Ok(true)
    }

    async fn request_cancel(&self, id: &Uuid, reason: &str) -> Result<bool, RepositoryError> {
        let mut instance = self.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if instance.status.is_terminal() {
            return Ok(false);
        }
        instance.cancel_reason = Some(reason.to_string());
        instance.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_events(&self, instance_id: &Uuid) -> Result<Vec<HistoryEvent>, RepositoryError> {
        Ok(self
            .events
            .get(instance_id)
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn append_events(
        &self,
        instance_id: &Uuid,
        events: &[HistoryEvent],
    ) -> Result<(), RepositoryError> {
        let mut log = self.events.entry(*instance_id).or_default();
        let last = log.last().map(|e| e.sequence).unwrap_or(0);
        check_append_sequence(last, events)?;
        log.extend_from_slice(events);
        Ok(())
    }

    async fn save_signal(&self, signal: &Signal) -> Result<(), RepositoryError> {
        self.signals.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn get_pending_signals(
        &self,
        instance_id: &Uuid,
        event_name: &str,
    ) -> Result<Vec<Signal>, RepositoryError> {
        let mut pending: Vec<Signal> = self
            .signals
            .iter()
            .filter(|s| !s.processed && s.instance_id == *instance_id && s.event_name == event_name)
            .map(|s| s.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn mark_signal_processed(&self, signal_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut signal = self.signals.get_mut(signal_id).ok_or(RepositoryError::NotFound)?;
        if signal.processed {
            return Ok(false);
        }
        signal.processed = true;
        Ok(true)
    }

    async fn find_waiting_instance(
        &self,
        event_name: Option<&str>,
        token: Option<&str>,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        if event_name.is_none() && token.is_none() {
            return Ok(None);
        }
        Ok(self
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Suspended)
            .filter(|i| event_name.is_none_or(|n| i.waiting_for_event.as_deref() == Some(n)))
            .filter(|i| token.is_none_or(|t| i.wait_token.as_deref() == Some(t)))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|i| i.clone()))
    }

    async fn create_timer(&self, timer: &Timer) -> Result<(), RepositoryError> {
        self.timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn get_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Timer>, RepositoryError> {
        let mut due: Vec<Timer> = self
            .timers
            .iter()
            .filter(|t| t.fire_at <= now)
            .map(|t| t.clone())
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.id.cmp(&b.id)));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete_timer(&self, timer_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.timers.remove(timer_id).is_some())
    }

    async fn delete_timers_for_instance(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let before = self.timers.len();
        self.timers.retain(|_, t| t.instance_id != *instance_id);
        Ok((before - self.timers.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

impl JobStore for MemoryStore {
    async fn create_job(&self, job: &JobRecord) -> Result<(), RepositoryError> {
        if self.jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<JobRecord>, RepositoryError> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn list_jobs(
        &self,
        worker_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        let mut list: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|j| worker_id.is_none_or(|w| j.worker_id == w))
            .map(|j| j.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit as usize);
        Ok(list)
    }

    async fn mark_running(&self, id: &Uuid) -> Result<JobRecord, RepositoryError> {
        let mut job = self.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if job.status != JobStatus::Queued {
            return Err(RepositoryError::Conflict(format!(
                "job {id} is {}, expected queued",
                job.status
            )));
        }
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn update_progress(&self, id: &Uuid, progress: u8) -> Result<(), RepositoryError> {
        let mut job = self.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        ensure_mutable(&job)?;
        job.progress = progress.min(100);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(&self, id: &Uuid, message: &str) -> Result<(), RepositoryError> {
        let mut job = self.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        job.logs.push(JobLog {
            at: now,
            message: message.to_string(),
        });
        job.updated_at = now;
        Ok(())
    }

    async fn complete_job(&self, id: &Uuid, output: &Value) -> Result<JobRecord, RepositoryError> {
        let mut job = self.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        job.status = JobStatus::Success;
        job.output = Some(output.clone());
        job.progress = 100;
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    async fn fail_job(&self, id: &Uuid, error: &JobError) -> Result<JobRecord, RepositoryError> {
        let mut job = self.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        ensure_mutable(&job)?;
        let now = Utc::now();
        job.status = JobStatus::Error;
        job.error = Some(error.clone());
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    async fn create_queue_job(&self, queue_job: &QueueJob) -> Result<(), RepositoryError> {
        self.queue_jobs.insert(queue_job.id, queue_job.clone());
        Ok(())
    }

    async fn get_queue_job(&self, id: &Uuid) -> Result<Option<QueueJob>, RepositoryError> {
        Ok(self.queue_jobs.get(id).map(|q| q.clone()))
    }

    async fn update_queue_step(
        &self,
        id: &Uuid,
        index: usize,
        job_id: Option<Uuid>,
        status: QueueStepStatus,
    ) -> Result<(), RepositoryError> {
        let mut queue_job = self.queue_jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let step = queue_job
            .steps
            .get_mut(index)
            .ok_or(RepositoryError::NotFound)?;
        if job_id.is_some() {
            step.job_id = job_id;
        }
        if !(status == QueueStepStatus::Dispatched && step.status.is_finished()) {
            step.status = status;
        }
        queue_job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_queue_job_status(
        &self,
        id: &Uuid,
        status: QueueJobStatus,
    ) -> Result<(), RepositoryError> {
        let mut queue_job = self.queue_jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        queue_job.status = status;
        queue_job.updated_at = now;
        if status.is_terminal() {
            queue_job.finished_at = Some(now);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use strand_types::workflow::{EventPayload, TimerKind};

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(Uuid::now_v7(), "wf", "1", json!({}))
    }

    fn started(id: Uuid, sequence: u64) -> HistoryEvent {
        HistoryEvent::new(id, sequence, EventPayload::WorkflowStarted { input: json!({}) })
    }

    #[tokio::test]
    async fn append_rejects_stale_sequence() {
        let store = MemoryStore::new();
        let inst = instance();
        store.create_instance(&inst).await.unwrap();

        store.append_events(&inst.id, &[started(inst.id, 1)]).await.unwrap();
        let err = store
            .append_events(&inst.id, &[started(inst.id, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.get_events(&inst.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_succeeds_at_most_once() {
        let store = MemoryStore::new();
        let inst = instance();
        store.create_instance(&inst).await.unwrap();
        store
            .update_instance_status(&inst.id, InstanceStatus::Suspended, &StatusUpdate::default())
            .await
            .unwrap();

        let from = [InstanceStatus::Suspended];
        let first = store
            .transition_status(&inst.id, &from, InstanceStatus::Running)
            .await
            .unwrap();
        let second = store
            .transition_status(&inst.id, &from, InstanceStatus::Running)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn find_waiting_by_token_and_event() {
        let store = MemoryStore::new();
        let inst = instance();
        store.create_instance(&inst).await.unwrap();
        store
            .update_instance_status(
                &inst.id,
                InstanceStatus::Suspended,
                &StatusUpdate {
                    waiting_for_event: Some("approve".to_string()),
                    wait_token: Some("tok-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let by_token = store.find_waiting_instance(None, Some("tok-1")).await.unwrap();
        assert_eq!(by_token.unwrap().id, inst.id);
        let by_event = store.find_waiting_instance(Some("approve"), None).await.unwrap();
        assert_eq!(by_event.unwrap().id, inst.id);
        assert!(store.find_waiting_instance(None, Some("other")).await.unwrap().is_none());
        assert!(store.find_waiting_instance(None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_timers_are_ordered_and_deletable() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let now = Utc::now();
        for (op, offset) in [(0, 5), (1, -10), (2, -20)] {
            store
                .create_timer(&Timer {
                    id: Uuid::now_v7(),
                    instance_id: id,
                    op,
                    kind: TimerKind::Sleep,
                    fire_at: now + Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        let due = store.get_due_timers(now, 10).await.unwrap();
        assert_eq!(due.iter().map(|t| t.op).collect::<Vec<_>>(), vec![2, 1]);

        assert!(store.delete_timer(&due[0].id).await.unwrap());
        assert!(!store.delete_timer(&due[0].id).await.unwrap());
        assert_eq!(store.delete_timers_for_instance(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn signals_are_consumed_once() {
        let store = MemoryStore::new();
        let signal = Signal {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            event_name: "approve".to_string(),
            token: None,
            payload: json!({"approved": true}),
            processed: false,
            created_at: Utc::now(),
        };
        store.save_signal(&signal).await.unwrap();

        let pending = store
            .get_pending_signals(&signal.instance_id, "approve")
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.mark_signal_processed(&signal.id).await.unwrap());
        assert!(!store.mark_signal_processed(&signal.id).await.unwrap());
        assert!(store
            .get_pending_signals(&signal.instance_id, "approve")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn terminal_job_rejects_mutation() {
        let store = MemoryStore::new();
        let job = JobRecord::queued(Uuid::now_v7(), "echo", json!({}), json!({}), None);
        store.create_job(&job).await.unwrap();

        store.mark_running(&job.id).await.unwrap();
        store.update_progress(&job.id, 40).await.unwrap();
        store.append_log(&job.id, "halfway").await.unwrap();
        let done = store.complete_job(&job.id, &json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.progress, 100);
        assert_eq!(done.logs.len(), 1);

        assert!(matches!(
            store.update_progress(&job.id, 10).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            store.fail_job(&job.id, &JobError::new("late")).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            store.append_log(&job.id, "late").await,
            Err(RepositoryError::Conflict(_))
        ));
    }
}
