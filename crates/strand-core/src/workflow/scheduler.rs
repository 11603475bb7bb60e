//! Signal delivery and timer sweeping.
//!
//! Both paths end the same way: persist what happened, claim the instance
//! (`Suspended -> Running`), and hand it back to the engine to replay. An
//! instance that cannot be claimed is left alone; a persisted signal stays
//! pending and is consumed by the next replay that reaches its wait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strand_types::error::RepositoryError;
use strand_types::workflow::{
    EventPayload, HistoryEvent, InstanceStatus, SLEEP_EVENT, Signal, Timer, TimerKind,
    WorkflowInstance,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::{Engine, WorkflowOutcome};
use super::error::EngineError;
use crate::repository::workflow::WorkflowStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no instance is waiting for {}", describe_target(.event_name, .token))]
    NoWaiter {
        event_name: Option<String>,
        token: Option<String>,
    },

    #[error("signal payload rejected: {0}")]
    Validation(String),

    #[error("'{0}' is a reserved event name")]
    ReservedEvent(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

fn describe_target(event_name: &Option<String>, token: &Option<String>) -> String {
    match (event_name, token) {
        (Some(e), Some(t)) => format!("event '{e}' with token '{t}'"),
        (Some(e), None) => format!("event '{e}'"),
        (None, Some(t)) => format!("token '{t}'"),
        (None, None) => "an unnamed event".to_string(),
    }
}

/// An externally delivered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
}

/// What happened to a delivered signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalDelivery {
    pub signal_id: Uuid,
    pub instance_id: Uuid,
    /// Whether this call claimed and re-ran the instance.
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkflowOutcome>,
}

/// Counts from one timer sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Timers whose instance was resumed.
    pub fired: u32,
    /// Timers left for a later sweep (instance busy or not resumable).
    pub skipped: u32,
    /// Timers deleted because their instance is gone or terminal.
    pub discarded: u32,
}

fn accepts_signal(instance: &WorkflowInstance, event_name: &str) -> bool {
    match instance.status {
        InstanceStatus::Suspended => instance.waiting_for_event.as_deref() == Some(event_name),
        InstanceStatus::Pending | InstanceStatus::Running => true,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Matches signals and due timers to suspended instances.
pub struct Scheduler<S: WorkflowStore> {
    engine: Engine<S>,
}

impl<S: WorkflowStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> Scheduler<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Deliver a signal to exactly one waiting instance.
    ///
    /// The waiter is resolved by token, else by explicit instance, else as
    /// the oldest instance suspended on `event_name`. An explicit instance
    /// must be parked on `event_name` or still in flight (`Pending` or
    /// `Running`), in which case the signal stays pending for its wait.
    pub async fn send_signal(&self, request: SignalRequest) -> Result<SignalDelivery, SchedulerError> {
        if request.event_name == SLEEP_EVENT {
            return Err(SchedulerError::ReservedEvent(request.event_name));
        }
        let store = self.engine.store();

        let instance = if let Some(token) = request.token.as_deref() {
            store
                .find_waiting_instance(Some(&request.event_name), Some(token))
                .await?
        } else if let Some(id) = request.instance_id {
            store
                .get_instance(&id)
                .await?
                .filter(|i| accepts_signal(i, &request.event_name))
        } else {
            store
                .find_waiting_instance(Some(&request.event_name), None)
                .await?
        };
        let Some(instance) = instance else {
            return Err(SchedulerError::NoWaiter {
                event_name: Some(request.event_name),
                token: request.token,
            });
        };

        self.deliver(instance, request.event_name, request.token, request.payload)
            .await
    }

    /// Resume the instance waiting under `token` with `payload`.
    pub async fn resume_by_token(&self, token: &str, payload: Value) -> Result<SignalDelivery, SchedulerError> {
        let instance = self
            .engine
            .store()
            .find_waiting_instance(None, Some(token))
            .await?;
        let Some(instance) = instance else {
            return Err(SchedulerError::NoWaiter {
                event_name: None,
                token: Some(token.to_string()),
            });
        };
        let Some(event_name) = instance.waiting_for_event.clone() else {
            return Err(SchedulerError::NoWaiter {
                event_name: None,
                token: Some(token.to_string()),
            });
        };
        self.deliver(instance, event_name, Some(token.to_string()), payload)
            .await
    }

    async fn deliver(
        &self,
        instance: WorkflowInstance,
        event_name: String,
        token: Option<String>,
        payload: Value,
    ) -> Result<SignalDelivery, SchedulerError> {
        let definition = self.engine.definition_for(&instance)?;
        definition
            .validate_signal(&event_name, &payload)
            .map_err(SchedulerError::Validation)?;

        let store = self.engine.store();
        let signal = Signal {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            event_name,
            token,
            payload,
            processed: false,
            created_at: Utc::now(),
        };
        store.save_signal(&signal).await?;
        tracing::info!(
            instance_id = %instance.id,
            signal_id = %signal.id,
            event = %signal.event_name,
            "signal received"
        );

        let claimed = store
            .transition_status(&instance.id, &[InstanceStatus::Suspended], InstanceStatus::Running)
            .await?;
        if !claimed {
            tracing::debug!(instance_id = %instance.id, "instance busy, signal left pending");
            return Ok(SignalDelivery {
                signal_id: signal.id,
                instance_id: instance.id,
                resumed: false,
                outcome: None,
            });
        }

        // On error the instance stays running with the signal persisted;
        // stale recovery replays it and consumes the signal.
        let outcome = self.engine.run_claimed(instance.id).await?;
        Ok(SignalDelivery {
            signal_id: signal.id,
            instance_id: instance.id,
            resumed: true,
            outcome: Some(outcome),
        })
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Fire every timer due at `now` (at most `limit`).
    pub async fn process_due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<SweepReport, SchedulerError> {
        let store = self.engine.store();
        let mut report = SweepReport::default();

        for timer in store.get_due_timers(now, limit).await? {
            let instance = store.get_instance(&timer.instance_id).await?;
            let Some(instance) = instance.filter(|i| !i.status.is_terminal()) else {
                store.delete_timer(&timer.id).await?;
                report.discarded += 1;
                continue;
            };
            if let Err(e) = self.engine.definition_for(&instance) {
                tracing::warn!(instance_id = %instance.id, error = %e, "timer skipped");
                report.skipped += 1;
                continue;
            }
            if !store
                .transition_status(&instance.id, &[InstanceStatus::Suspended], InstanceStatus::Running)
                .await?
            {
                report.skipped += 1;
                continue;
            }

            if let Err(e) = self.complete_timer(&timer).await {
                tracing::warn!(instance_id = %instance.id, timer_id = %timer.id, error = %e, "timer not completed");
                self.engine.release_claim(instance.id).await;
                report.skipped += 1;
                continue;
            }
            match self.engine.run_claimed(instance.id).await {
                Ok(outcome) => {
                    tracing::debug!(
                        instance_id = %instance.id,
                        status = %outcome.status(),
                        "timer resumed instance"
                    );
                }
                Err(e) => {
                    // Left running; stale recovery re-drives it from history.
                    tracing::warn!(instance_id = %instance.id, error = %e, "resume after timer failed");
                }
            }
            report.fired += 1;
        }

        if report != SweepReport::default() {
            tracing::debug!(
                fired = report.fired,
                skipped = report.skipped,
                discarded = report.discarded,
                "timer sweep"
            );
        }
        Ok(report)
    }

    /// Append the timer's completion event (unless already recorded) and delete it.
    async fn complete_timer(&self, timer: &Timer) -> Result<(), SchedulerError> {
        let store = self.engine.store();
        let history = store.get_events(&timer.instance_id).await?;

        let already_done = history.iter().any(|e| {
            e.payload.op() == Some(timer.op)
                && matches!(
                    e.payload,
                    EventPayload::SleepCompleted { .. } | EventPayload::EventReceived { .. }
                )
        });
        if !already_done {
            let payload = match &timer.kind {
                TimerKind::Sleep => {
                    let name = history
                        .iter()
                        .find(|e| e.payload.op() == Some(timer.op))
                        .and_then(|e| e.payload.op_name())
                        .unwrap_or("sleep")
                        .to_string();
                    EventPayload::SleepCompleted { op: timer.op, name }
                }
                TimerKind::EventTimeout { event_name } => EventPayload::EventReceived {
                    op: timer.op,
                    event_name: event_name.clone(),
                    payload: json!({"timeout": true}),
                    timed_out: true,
                },
            };
            let next = history.last().map(|e| e.sequence + 1).unwrap_or(1);
            store
                .append_events(
                    &timer.instance_id,
                    &[HistoryEvent::new(timer.instance_id, next, payload)],
                )
                .await?;
        }
        store.delete_timer(&timer.id).await?;
        Ok(())
    }

    /// Sweep due timers every `interval` until `shutdown` is cancelled.
    ///
    /// Each tick also recovers instances stranded in `Running` for longer
    /// than `stale_after`.
    pub async fn run_sweeper(
        self,
        interval: Duration,
        batch_size: u32,
        stale_after: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = interval.as_millis() as u64, "timer sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.process_due_timers(Utc::now(), batch_size).await {
                        tracing::error!(error = %e, "timer sweep failed");
                    }
                    if let Err(e) = self.engine.recover_stale(stale_after, batch_size).await {
                        tracing::error!(error = %e, "stale instance recovery failed");
                    }
                }
            }
        }
        tracing::info!("timer sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
