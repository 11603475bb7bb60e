//! Workflow engine: instance lifecycle, claims, and outcome recording.
//!
//! The engine loads an instance's history, runs the handler against a
//! replaying [`WorkflowContext`], and records what the handler did:
//!
//! - `Ok(value)` appends `WORKFLOW_COMPLETED` and marks the instance `Completed`.
//! - `FlowError::Suspended` marks it `Suspended` with `waiting_for_event` set.
//! - `FlowError::Cancelled` appends `WORKFLOW_CANCELLED` and marks it `Cancelled`.
//! - A storage error leaves the instance `Running` for stale recovery.
//! - Any other error appends `WORKFLOW_FAILED`, marks it `Failed`, and is
//!   returned to the caller as `EngineError::WorkflowFailed`.
//!
//! Only the runner holding the claim (`Pending | Suspended -> Running`) ever
//! appends to an instance's history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use strand_types::error::RepositoryError;
use strand_types::event::EngineEvent;
use strand_types::workflow::{
    EventPayload, HistoryEvent, InstanceStatus, SLEEP_EVENT, StatusUpdate, WorkflowInstance,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::definition::{WorkflowDefinition, WorkflowRegistry};
use super::error::{EngineError, FlowError};
use crate::event::EventBus;
use crate::repository::workflow::WorkflowStore;

const CLAIMABLE: [InstanceStatus; 2] = [InstanceStatus::Pending, InstanceStatus::Suspended];

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where an execution left the instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed { result: Value },
    Suspended {
        waiting_for: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Cancelled { reason: String },
    Failed { error: String },
}

impl WorkflowOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            WorkflowOutcome::Completed { .. } => InstanceStatus::Completed,
            WorkflowOutcome::Suspended { .. } => InstanceStatus::Suspended,
            WorkflowOutcome::Cancelled { .. } => InstanceStatus::Cancelled,
            WorkflowOutcome::Failed { .. } => InstanceStatus::Failed,
        }
    }

    /// Map `Failed` to `EngineError::WorkflowFailed` for public callers.
    fn into_result(self, instance_id: Uuid) -> Result<WorkflowOutcome, EngineError> {
        match self {
            WorkflowOutcome::Failed { error } => Err(EngineError::WorkflowFailed {
                instance_id,
                message: error,
            }),
            other => Ok(other),
        }
    }
}

/// Result of [`Engine::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The instance was parked and is now `Cancelled`.
    Cancelled,
    /// The instance is running; it stops at its next operation boundary.
    Requested,
}

/// What a read-only replay of an instance's history reproduced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayResult {
    Completed { result: Value },
    Suspended { waiting_for: String },
    Cancelled { reason: String },
    Failed { error: String },
    /// The handler requested something the history does not contain.
    Diverged { error: String },
}

/// Report returned by [`Engine::verify_replay`].
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub instance_id: Uuid,
    pub recorded_status: InstanceStatus,
    pub reproduced: ReplayResult,
    /// Whether the replay reproduced the recorded status and result.
    pub matches: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes workflow instances against a [`WorkflowStore`].
pub struct Engine<S: WorkflowStore> {
    store: Arc<S>,
    registry: WorkflowRegistry<S>,
    bus: EventBus,
    /// Cancellation tokens of instances executing in this process.
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<S: WorkflowStore> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            running: Arc::clone(&self.running),
        }
    }
}

impl<S: WorkflowStore + 'static> Engine<S> {
    pub fn new(store: Arc<S>, registry: WorkflowRegistry<S>, bus: EventBus) -> Self {
        Self {
            store,
            registry,
            bus,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry<S> {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Start a registered workflow. Generates a UUIDv7 when `instance_id` is `None`.
    pub async fn start(
        &self,
        workflow_id: &str,
        input: Value,
        instance_id: Option<Uuid>,
    ) -> Result<(Uuid, WorkflowOutcome), EngineError> {
        let definition = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_id.to_string()))?;
        let id = instance_id.unwrap_or_else(Uuid::now_v7);
        let outcome = self.execute(&definition, id, input).await?;
        Ok((id, outcome))
    }

    /// Execute `definition` as instance `instance_id`.
    ///
    /// Creates the instance if it does not exist; otherwise loads it and
    /// replays its history. A terminal instance is not re-run: its recorded
    /// outcome is returned.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition<S>,
        instance_id: Uuid,
        input: Value,
    ) -> Result<WorkflowOutcome, EngineError> {
        let instance = match self.store.get_instance(&instance_id).await? {
            Some(existing) => existing,
            None => {
                let instance =
                    WorkflowInstance::new(instance_id, &definition.id, &definition.version, input);
                self.store.create_instance(&instance).await?;
                tracing::info!(
                    instance_id = %instance_id,
                    workflow_id = %definition.id,
                    "created workflow instance"
                );
                instance
            }
        };

        if instance.status.is_terminal() {
            return recorded_outcome(&instance).into_result(instance_id);
        }
        check_version(definition, &instance)?;
        self.claim(&instance).await?;
        self.drive(definition, instance)
            .await?
            .into_result(instance_id)
    }

    /// Re-execute a suspended instance.
    pub async fn resume(&self, instance_id: Uuid) -> Result<WorkflowOutcome, EngineError> {
        let instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id: instance_id,
                status: instance.status,
            });
        }
        let definition = self.definition_for(&instance)?;
        self.claim(&instance).await?;
        self.drive(&definition, instance)
            .await?
            .into_result(instance_id)
    }

    /// Re-drive instances stranded in `Running` by a runner that went away.
    ///
    /// An instance is stranded when no run in this process holds it and it
    /// has not been updated for `older_than`. Its claim is released and the
    /// instance is replayed from history, which finishes any half-recorded
    /// step and re-parks it on its pending wait. Returns the recovered ids.
    pub async fn recover_stale(
        &self,
        older_than: std::time::Duration,
        limit: u32,
    ) -> Result<Vec<Uuid>, EngineError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut recovered = Vec::new();
        for instance in self
            .store
            .list_instances(Some(InstanceStatus::Running), limit)
            .await?
        {
            if instance.updated_at > cutoff || self.running.contains_key(&instance.id) {
                continue;
            }
            if !self
                .store
                .transition_status(&instance.id, &[InstanceStatus::Running], InstanceStatus::Suspended)
                .await?
            {
                continue;
            }
            tracing::warn!(
                instance_id = %instance.id,
                updated_at = %instance.updated_at,
                "recovering stranded instance"
            );
            match self.resume(instance.id).await {
                Ok(outcome) => {
                    tracing::info!(instance_id = %instance.id, status = %outcome.status(), "instance recovered");
                }
                Err(EngineError::WorkflowFailed { .. }) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %instance.id, error = %e, "recovered instance did not resume");
                }
            }
            recovered.push(instance.id);
        }
        Ok(recovered)
    }

    /// Hand a claim back (`Running -> Suspended`) after the claimant failed
    /// before driving the instance to its next resting state.
    pub(crate) async fn release_claim(&self, instance_id: Uuid) {
        if let Err(e) = self
            .store
            .transition_status(&instance_id, &[InstanceStatus::Running], InstanceStatus::Suspended)
            .await
        {
            tracing::error!(instance_id = %instance_id, error = %e, "failed to release claim");
        }
    }

    /// Cancel an instance.
    ///
    /// Parked instances are cancelled immediately. A running instance gets a
    /// cancellation request that its handler observes at the next operation
    /// boundary.
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<CancelOutcome, EngineError> {
        let instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id: instance_id,
                status: instance.status,
            });
        }

        if self
            .store
            .transition_status(&instance_id, &CLAIMABLE, InstanceStatus::Running)
            .await?
        {
            let history = self.store.get_events(&instance_id).await?;
            let next = history.last().map(|e| e.sequence + 1).unwrap_or(1);
            self.store
                .append_events(
                    &instance_id,
                    &[HistoryEvent::new(
                        instance_id,
                        next,
                        EventPayload::WorkflowCancelled {
                            reason: reason.to_string(),
                        },
                    )],
                )
                .await?;
            self.finish_cancelled(instance_id, reason).await?;
            return Ok(CancelOutcome::Cancelled);
        }

        if !self.store.request_cancel(&instance_id, reason).await? {
            let status = self.load(instance_id).await?.status;
            return Err(EngineError::AlreadyTerminal {
                id: instance_id,
                status,
            });
        }
        if let Some(token) = self.running.get(&instance_id) {
            token.cancel();
        }
        tracing::info!(instance_id = %instance_id, reason, "cancellation requested");
        Ok(CancelOutcome::Requested)
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.store.get_instance(&instance_id).await?)
    }

    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.store.list_instances(status, limit).await?)
    }

    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, EngineError> {
        Ok(self.store.get_events(&instance_id).await?)
    }

    /// Replay the full history without appending anything and compare the
    /// reproduced outcome with the recorded one.
    pub async fn verify_replay(&self, instance_id: Uuid) -> Result<ReplayReport, EngineError> {
        let instance = self.load(instance_id).await?;
        let definition = self.definition_for(&instance)?;
        let history = self.store.get_events(&instance_id).await?;

        let ctx = WorkflowContext::new(
            Arc::clone(&self.store),
            instance_id,
            &instance.workflow_id,
            &history,
            None,
            CancellationToken::new(),
            true,
        );
        let reproduced = match definition.invoke(ctx, instance.input.clone()).await {
            Ok(result) => ReplayResult::Completed { result },
            Err(FlowError::Suspended { waiting_for, .. }) => ReplayResult::Suspended { waiting_for },
            Err(FlowError::Cancelled(reason)) => ReplayResult::Cancelled { reason },
            Err(e @ FlowError::NonDeterministic { .. }) => ReplayResult::Diverged {
                error: e.to_string(),
            },
            Err(e) => ReplayResult::Failed {
                error: e.to_string(),
            },
        };

        let cancelled_in_history = history
            .iter()
            .any(|e| matches!(e.payload, EventPayload::WorkflowCancelled { .. }));
        let matches = match (&instance.status, &reproduced) {
            (_, ReplayResult::Diverged { .. }) => false,
            (InstanceStatus::Cancelled, _) => cancelled_in_history,
            (InstanceStatus::Completed, ReplayResult::Completed { result }) => {
                instance.result.as_ref() == Some(result)
            }
            (InstanceStatus::Suspended, ReplayResult::Suspended { waiting_for }) => {
                instance.waiting_for_event.as_deref() == Some(waiting_for.as_str())
            }
            (InstanceStatus::Failed, ReplayResult::Failed { error }) => {
                instance.error.as_deref() == Some(error.as_str())
            }
            _ => false,
        };

        tracing::debug!(instance_id = %instance_id, matches, "replay verified");
        Ok(ReplayReport {
            instance_id,
            recorded_status: instance.status,
            reproduced,
            matches,
        })
    }

    // -----------------------------------------------------------------------
    // Crate-internal entry points (scheduler)
    // -----------------------------------------------------------------------

    /// Definition registered for an instance's workflow, version-checked.
    pub(crate) fn definition_for(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Arc<WorkflowDefinition<S>>, EngineError> {
        let definition = self
            .registry
            .get(&instance.workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(instance.workflow_id.clone()))?;
        check_version(&definition, instance)?;
        Ok(definition)
    }

    /// Run an instance the caller has already claimed (status `Running`).
    pub(crate) async fn run_claimed(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowOutcome, EngineError> {
        let instance = self.load(instance_id).await?;
        let definition = match self.definition_for(&instance) {
            Ok(definition) => definition,
            Err(e) => {
                // Release the claim so the instance is not stranded as running.
                self.store
                    .transition_status(&instance_id, &[InstanceStatus::Running], InstanceStatus::Suspended)
                    .await?;
                return Err(e);
            }
        };
        self.drive(&definition, instance).await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn load(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.store
            .get_instance(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    async fn claim(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        if self
            .store
            .transition_status(&instance.id, &CLAIMABLE, InstanceStatus::Running)
            .await?
        {
            return Ok(());
        }
        let status = self
            .store
            .get_instance(&instance.id)
            .await?
            .map(|i| i.status)
            .unwrap_or(instance.status);
        Err(EngineError::NotClaimable {
            id: instance.id,
            status,
        })
    }

    /// Run a claimed instance until it completes, fails, or parks.
    async fn drive(
        &self,
        definition: &WorkflowDefinition<S>,
        instance: WorkflowInstance,
    ) -> Result<WorkflowOutcome, EngineError> {
        let token = CancellationToken::new();
        self.running.insert(instance.id, token.clone());
        let result = self.drive_claimed(definition, &instance, token).await;
        self.running.remove(&instance.id);
        result
    }

    async fn drive_claimed(
        &self,
        definition: &WorkflowDefinition<S>,
        instance: &WorkflowInstance,
        token: CancellationToken,
    ) -> Result<WorkflowOutcome, EngineError> {
        let id = instance.id;
        loop {
            let mut history = self.store.get_events(&id).await?;
            if history.is_empty() {
                let started = HistoryEvent::new(
                    id,
                    1,
                    EventPayload::WorkflowStarted {
                        input: instance.input.clone(),
                    },
                );
                self.store.append_events(&id, std::slice::from_ref(&started)).await?;
                history.push(started);
                self.bus.publish(EngineEvent::InstanceStarted {
                    instance_id: id,
                    workflow_id: instance.workflow_id.clone(),
                });
                tracing::info!(instance_id = %id, workflow_id = %instance.workflow_id, "workflow started");
            } else {
                tracing::debug!(instance_id = %id, events = history.len(), "replaying workflow");
            }

            let ctx = WorkflowContext::new(
                Arc::clone(&self.store),
                id,
                &instance.workflow_id,
                &history,
                Some(self.bus.clone()),
                token.clone(),
                false,
            );
            let result = definition.invoke(ctx.clone(), instance.input.clone()).await;
            let outcome = self.settle(&ctx, id, result).await?;

            // A signal that arrived while we were still running would have
            // found no suspended waiter; pick it up now.
            if let WorkflowOutcome::Suspended { waiting_for, .. } = &outcome {
                if waiting_for != SLEEP_EVENT
                    && !self.store.get_pending_signals(&id, waiting_for).await?.is_empty()
                    && self
                        .store
                        .transition_status(&id, &[InstanceStatus::Suspended], InstanceStatus::Running)
                        .await?
                {
                    tracing::debug!(instance_id = %id, event = %waiting_for, "pending signal found, re-running");
                    continue;
                }
            }
            return Ok(outcome);
        }
    }

    /// Record the handler's result on the instance.
    async fn settle(
        &self,
        ctx: &WorkflowContext<S>,
        id: Uuid,
        result: Result<Value, FlowError>,
    ) -> Result<WorkflowOutcome, EngineError> {
        match result {
            Ok(value) => {
                ctx.append(vec![EventPayload::WorkflowCompleted {
                    result: value.clone(),
                }])
                .await
                .map_err(storage)?;
                self.store
                    .update_instance_status(
                        &id,
                        InstanceStatus::Completed,
                        &StatusUpdate {
                            result: Some(value.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store.delete_timers_for_instance(&id).await?;
                self.bus.publish(EngineEvent::InstanceCompleted { instance_id: id });
                tracing::info!(instance_id = %id, "workflow completed");
                Ok(WorkflowOutcome::Completed { result: value })
            }
            Err(FlowError::Suspended { waiting_for, token }) => {
                // A cancel requested while running is honoured before parking.
                if let Some(reason) = self.load(id).await?.cancel_reason {
                    return self.record_cancelled(ctx, id, reason).await;
                }
                self.store
                    .update_instance_status(
                        &id,
                        InstanceStatus::Suspended,
                        &StatusUpdate {
                            waiting_for_event: Some(waiting_for.clone()),
                            wait_token: token.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.bus.publish(EngineEvent::InstanceSuspended {
                    instance_id: id,
                    waiting_for: waiting_for.clone(),
                });
                tracing::debug!(instance_id = %id, waiting_for = %waiting_for, "workflow suspended");
                Ok(WorkflowOutcome::Suspended { waiting_for, token })
            }
            Err(FlowError::Cancelled(reason)) => self.record_cancelled(ctx, id, reason).await,
            // Not the workflow's fault: stay claimed for stale recovery.
            Err(FlowError::Storage(e)) => {
                tracing::warn!(instance_id = %id, error = %e, "storage failed mid-run");
                Err(EngineError::Storage(e))
            }
            Err(err) => {
                let message = err.to_string();
                ctx.append(vec![EventPayload::WorkflowFailed {
                    error: message.clone(),
                }])
                .await
                .map_err(storage)?;
                self.store
                    .update_instance_status(
                        &id,
                        InstanceStatus::Failed,
                        &StatusUpdate {
                            error: Some(message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store.delete_timers_for_instance(&id).await?;
                self.bus.publish(EngineEvent::InstanceFailed {
                    instance_id: id,
                    error: message.clone(),
                });
                tracing::error!(instance_id = %id, error = %message, "workflow failed");
                Ok(WorkflowOutcome::Failed { error: message })
            }
        }
    }

    async fn record_cancelled(
        &self,
        ctx: &WorkflowContext<S>,
        id: Uuid,
        reason: String,
    ) -> Result<WorkflowOutcome, EngineError> {
        ctx.append(vec![EventPayload::WorkflowCancelled {
            reason: reason.clone(),
        }])
        .await
        .map_err(storage)?;
        self.finish_cancelled(id, &reason).await?;
        Ok(WorkflowOutcome::Cancelled { reason })
    }

    async fn finish_cancelled(&self, id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.store
            .update_instance_status(
                &id,
                InstanceStatus::Cancelled,
                &StatusUpdate {
                    cancel_reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.store.delete_timers_for_instance(&id).await?;
        self.bus.publish(EngineEvent::InstanceCancelled {
            instance_id: id,
            reason: reason.to_string(),
        });
        tracing::info!(instance_id = %id, reason, "workflow cancelled");
        Ok(())
    }
}

fn check_version<S: WorkflowStore>(
    definition: &WorkflowDefinition<S>,
    instance: &WorkflowInstance,
) -> Result<(), EngineError> {
    if definition.version != instance.version {
        return Err(EngineError::VersionMismatch {
            id: instance.id,
            recorded: instance.version.clone(),
            registered: definition.version.clone(),
        });
    }
    Ok(())
}

fn recorded_outcome(instance: &WorkflowInstance) -> WorkflowOutcome {
    match instance.status {
        InstanceStatus::Cancelled => WorkflowOutcome::Cancelled {
            reason: instance.cancel_reason.clone().unwrap_or_default(),
        },
        InstanceStatus::Failed => WorkflowOutcome::Failed {
            error: instance.error.clone().unwrap_or_default(),
        },
        _ => WorkflowOutcome::Completed {
            result: instance.result.clone().unwrap_or(Value::Null),
        },
    }
}

fn storage(err: FlowError) -> EngineError {
    match err {
        FlowError::Storage(e) => EngineError::Storage(e),
        other => EngineError::Storage(RepositoryError::Query(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use strand_types::workflow::{EventType, RetryPolicy};

    use crate::storage::memory::MemoryStore;
    use crate::workflow::context::{Branch, WaitOptions};

    fn engine_with(definition: WorkflowDefinition<MemoryStore>) -> Engine<MemoryStore> {
        let registry = WorkflowRegistry::new();
        registry.register(definition);
        Engine::new(Arc::new(MemoryStore::new()), registry, EventBus::new(64))
    }

    fn event_types(history: &[HistoryEvent]) -> Vec<EventType> {
        history.iter().map(|e| e.event_type()).collect()
    }

    #[tokio::test]
    async fn completes_and_records_history() {
        let engine = engine_with(WorkflowDefinition::new("double", "1", |ctx, input| async move {
            let n = input["n"].as_i64().unwrap_or(0);
            let doubled: i64 = ctx.step("double", || async move { Ok::<_, String>(n * 2) }).await?;
            Ok(json!({"doubled": doubled}))
        }));

        let (id, outcome) = engine.start("double", json!({"n": 21}), None).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed { result: json!({"doubled": 42}) });

        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.result, Some(json!({"doubled": 42})));

        let history = engine.history(id).await.unwrap();
        assert_eq!(
            event_types(&history),
            vec![
                EventType::WorkflowStarted,
                EventType::StepStarted,
                EventType::StepCompleted,
                EventType::WorkflowCompleted,
            ]
        );
        assert_eq!(
            history.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn completed_step_is_not_invoked_on_replay() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let engine = engine_with(WorkflowDefinition::new("approval", "1", move |ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                let fetched: Value = ctx
                    .step("fetch", || {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, String>(json!({"rows": 3}))
                        }
                    })
                    .await?;
                let decision = ctx.wait_for_event("approve", Default::default()).await?;
                Ok(json!({"fetched": fetched, "decision": decision}))
            }
        }));

        let id = Uuid::now_v7();
        let (_, outcome) = engine.start("approval", json!({}), Some(id)).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Suspended { ref waiting_for, .. } if waiting_for == "approve"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Resume without a signal: replays the step from history and parks again.
        let outcome = engine.resume(id).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Suspended { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_retries_then_records_single_completion() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let engine = engine_with(WorkflowDefinition::new("flaky", "1", move |ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                let value: u32 = ctx
                    .step_with("flaky", RetryPolicy::fixed(3, 1), || {
                        let counter = Arc::clone(&counter);
                        async move {
                            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            if n < 3 { Err(format!("attempt {n} failed")) } else { Ok(n) }
                        }
                    })
                    .await?;
                Ok(json!(value))
            }
        }));

        let (id, outcome) = engine.start("flaky", json!({}), None).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed { result: json!(3) });
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let history = engine.history(id).await.unwrap();
        let completions = history
            .iter()
            .filter(|e| e.event_type() == EventType::StepCompleted)
            .count();
        assert_eq!(completions, 1);
        assert!(!history.iter().any(|e| e.event_type() == EventType::StepFailed));
    }

    #[tokio::test]
    async fn exhausted_step_fails_workflow() {
        let engine = engine_with(WorkflowDefinition::new("broken", "1", |ctx, _input| async move {
            let _: Value = ctx
                .step_with("always", RetryPolicy::fixed(2, 1), || async {
                    Err::<Value, _>("nope")
                })
                .await?;
            Ok(json!(null))
        }));

        let id = Uuid::now_v7();
        let err = engine.start("broken", json!({}), Some(id)).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowFailed { instance_id, .. } if instance_id == id));

        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.error.unwrap().contains("after 2 attempt(s)"));

        let history = engine.history(id).await.unwrap();
        match &history[2].payload {
            EventPayload::StepFailed { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("expected STEP_FAILED, got {other:?}"),
        }
        assert_eq!(history.last().unwrap().event_type(), EventType::WorkflowFailed);

        // Terminal instances are never re-executed.
        let err = engine.resume(id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn verify_replay_reproduces_outcome() {
        let engine = engine_with(WorkflowDefinition::new("sum", "1", |ctx, input| async move {
            let a: i64 = ctx.step("a", || async { Ok::<_, String>(2) }).await?;
            let b: i64 = ctx.step("b", || async { Ok::<_, String>(3) }).await?;
            Ok(json!({"sum": a + b, "input": input}))
        }));

        let (id, _) = engine.start("sum", json!({"k": 1}), None).await.unwrap();
        let report = engine.verify_replay(id).await.unwrap();
        assert!(report.matches);
        assert_eq!(report.recorded_status, InstanceStatus::Completed);
        assert_eq!(
            report.reproduced,
            ReplayResult::Completed { result: json!({"sum": 5, "input": {"k": 1}}) }
        );
        // Read-only replay appends nothing.
        assert_eq!(engine.history(id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn changed_handler_is_detected_as_non_deterministic() {
        let registry = WorkflowRegistry::new();
        registry.register(WorkflowDefinition::new("evolving", "1", |ctx, _input| async move {
            let _: i64 = ctx.step("first", || async { Ok::<_, String>(1) }).await?;
            ctx.wait_for_event("go", Default::default()).await?;
            Ok(json!("done"))
        }));
        let engine = Engine::new(Arc::new(MemoryStore::new()), registry.clone(), EventBus::new(8));

        let (id, _) = engine.start("evolving", json!({}), None).await.unwrap();

        // Same version, different first operation.
        registry.register(WorkflowDefinition::new("evolving", "1", |ctx, _input| async move {
            let _: i64 = ctx.step("renamed", || async { Ok::<_, String>(1) }).await?;
            Ok(json!("done"))
        }));
        let err = engine.resume(id).await.unwrap_err();
        match err {
            EngineError::WorkflowFailed { message, .. } => {
                assert!(message.contains("non-deterministic replay at operation 0"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let registry = WorkflowRegistry::new();
        registry.register(WorkflowDefinition::new("pinned", "1", |ctx, _input| async move {
            ctx.wait_for_event("go", Default::default()).await?;
            Ok(json!(null))
        }));
        let engine = Engine::new(Arc::new(MemoryStore::new()), registry.clone(), EventBus::new(8));
        let (id, _) = engine.start("pinned", json!({}), None).await.unwrap();

        registry.register(WorkflowDefinition::new("pinned", "2", |_ctx, _input| async move {
            Ok(json!(null))
        }));
        let err = engine.resume(id).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionMismatch { ref recorded, .. } if recorded == "1"));
        // The instance stays parked.
        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Suspended);
    }

    #[tokio::test]
    async fn cancel_parked_instance() {
        let engine = engine_with(WorkflowDefinition::new("parked", "1", |ctx, _input| async move {
            ctx.wait_for_event("go", WaitOptions::new().timeout("1h")).await?;
            Ok(json!(null))
        }));
        let (id, _) = engine.start("parked", json!({}), None).await.unwrap();

        let outcome = engine.cancel(id, "operator abort").await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);

        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        assert_eq!(instance.cancel_reason.as_deref(), Some("operator abort"));
        assert_eq!(
            engine.history(id).await.unwrap().last().unwrap().event_type(),
            EventType::WorkflowCancelled
        );
        // The timeout timer went with it.
        let due = engine
            .store()
            .get_due_timers(chrono::Utc::now() + chrono::Duration::days(1), 10)
            .await
            .unwrap();
        assert!(due.is_empty());

        assert!(matches!(
            engine.cancel(id, "again").await,
            Err(EngineError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn parallel_branches_record_in_start_order() {
        let engine = engine_with(WorkflowDefinition::new("fan-out", "1", |ctx, _input| async move {
            let results = ctx
                .parallel(vec![
                    Branch::new("slow", || async {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, String>(json!("slow"))
                    }),
                    Branch::new("fast", || async { Ok::<_, String>(json!("fast")) }),
                ])
                .await?;
            Ok(json!(results))
        }));

        let (id, outcome) = engine.start("fan-out", json!({}), None).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed { result: json!(["slow", "fast"]) });

        let names: Vec<String> = engine
            .history(id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == EventType::StepCompleted)
            .filter_map(|e| e.payload.op_name().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["slow", "fast"]);
        assert!(engine.verify_replay(id).await.unwrap().matches);
    }

    #[tokio::test]
    async fn events_are_published_on_the_bus() {
        let engine = engine_with(WorkflowDefinition::new("noop", "1", |_ctx, input| async move { Ok(input) }));
        let mut rx = engine.event_bus().subscribe();

        let (id, _) = engine.start("noop", json!(1), None).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::InstanceStarted { instance_id, .. } if instance_id == id));
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::InstanceCompleted { instance_id: id });
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let engine = engine_with(WorkflowDefinition::new("noop", "1", |_ctx, input| async move { Ok(input) }));
        assert!(matches!(
            engine.start("missing", json!({}), None).await,
            Err(EngineError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn sleep_past_the_calendar_fails_the_instance() {
        let engine = engine_with(WorkflowDefinition::new("forever", "1", |ctx, _input| async move {
            ctx.sleep("100000000d").await?;
            Ok(json!(null))
        }));

        let id = Uuid::now_v7();
        let err = engine.start("forever", json!({}), Some(id)).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowFailed { .. }));

        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.error.unwrap().contains("out of range"));
        assert!(engine
            .store()
            .get_due_timers(chrono::Utc::now() + chrono::Duration::days(365), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn wait_timeout_past_the_calendar_fails_the_instance() {
        let engine = engine_with(WorkflowDefinition::new("patient", "1", |ctx, _input| async move {
            let decision = ctx
                .wait_for_event("approve", WaitOptions::new().timeout("100000000d"))
                .await?;
            Ok(decision)
        }));

        let id = Uuid::now_v7();
        assert!(engine.start("patient", json!({}), Some(id)).await.is_err());
        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
    }

    fn charge_then_approve(calls: Arc<AtomicU32>) -> WorkflowDefinition<MemoryStore> {
        WorkflowDefinition::new("charge", "1", move |ctx, _input| {
            let calls = Arc::clone(&calls);
            async move {
                let receipt: Value = ctx
                    .step("charge", || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, String>(json!({"charged": true}))
                        }
                    })
                    .await?;
                let decision = ctx.wait_for_event("approve", Default::default()).await?;
                Ok(json!({"receipt": receipt, "decision": decision}))
            }
        })
    }

    #[tokio::test]
    async fn stranded_running_instance_is_recovered() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(charge_then_approve(Arc::clone(&calls)));
        let (id, _) = engine.start("charge", json!({}), None).await.unwrap();

        // The runner that claimed it went away.
        assert!(engine
            .store()
            .transition_status(&id, &[InstanceStatus::Suspended], InstanceStatus::Running)
            .await
            .unwrap());
        assert!(matches!(
            engine.resume(id).await,
            Err(EngineError::NotClaimable { .. })
        ));

        // Recently touched instances are left to their runner.
        let recovered = engine
            .recover_stale(std::time::Duration::from_secs(3_600), 10)
            .await
            .unwrap();
        assert!(recovered.is_empty());

        let recovered = engine
            .recover_stale(std::time::Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(recovered, vec![id]);

        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Suspended);
        assert_eq!(instance.waiting_for_event.as_deref(), Some("approve"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_finishes_a_half_recorded_step() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(charge_then_approve(Arc::clone(&calls)));

        // A runner crashed after recording STEP_STARTED.
        let id = Uuid::now_v7();
        let mut instance = WorkflowInstance::new(id, "charge", "1", json!({}));
        instance.status = InstanceStatus::Running;
        engine.store().create_instance(&instance).await.unwrap();
        engine
            .store()
            .append_events(
                &id,
                &[
                    HistoryEvent::new(id, 1, EventPayload::WorkflowStarted { input: json!({}) }),
                    HistoryEvent::new(
                        id,
                        2,
                        EventPayload::StepStarted {
                            op: 0,
                            name: "charge".to_string(),
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        let recovered = engine
            .recover_stale(std::time::Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(recovered, vec![id]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let history = engine.history(id).await.unwrap();
        assert_eq!(
            event_types(&history),
            vec![
                EventType::WorkflowStarted,
                EventType::StepStarted,
                EventType::StepCompleted,
                EventType::EventWaiting,
            ]
        );
        let instance = engine.get_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Suspended);
    }
}
