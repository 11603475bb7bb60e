//! Handler-facing workflow context with deterministic replay.
//!
//! Every request a handler makes (`step`, `parallel`, `sleep`,
//! `wait_for_event`) is assigned an operation index (`op`) synchronously, in
//! call order. The recorded history is indexed by `op`: when an operation's
//! events are already in the log, the recorded result is returned without
//! running side effects. Otherwise the operation runs live and its events
//! are appended. A recorded operation whose kind or name differs from what
//! the handler now requests is a `FlowError::NonDeterministic`.
//!
//! Waits that cannot complete yet return `FlowError::Suspended`; the engine
//! turns that into a durable `Suspended` status.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strand_types::event::EngineEvent;
use strand_types::workflow::{
    EventPayload, EventType, HistoryEvent, RetryPolicy, SLEEP_EVENT, Timer, TimerKind,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::duration::IntoWaitDuration;
use super::error::FlowError;
use super::retry::RetryHandler;
use crate::event::EventBus;
use crate::repository::workflow::WorkflowStore;

const SLEEP_NAME: &str = "sleep";

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Step,
    Sleep,
    Wait,
}

impl OpKind {
    fn of(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::StepStarted | EventType::StepCompleted | EventType::StepFailed => {
                Some(OpKind::Step)
            }
            EventType::SleepStarted | EventType::SleepCompleted => Some(OpKind::Sleep),
            EventType::EventWaiting | EventType::EventReceived => Some(OpKind::Wait),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Step => "step",
            OpKind::Sleep => "sleep",
            OpKind::Wait => "wait",
        })
    }
}

// ---------------------------------------------------------------------------
// Wait options and parallel branches
// ---------------------------------------------------------------------------

/// Options for [`WorkflowContext::wait_for_event`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    timeout: Option<Result<Duration, String>>,
    token: Option<String>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with `{"timeout": true}` if no signal arrives within `timeout`.
    ///
    /// Accepts a `Duration`, milliseconds, or a string such as `"1h"`.
    pub fn timeout<D: IntoWaitDuration>(mut self, timeout: D) -> Self {
        self.timeout = Some(timeout.into_wait_duration().map_err(|e| e.to_string()));
        self
    }

    /// Correlation token signals can address this wait by.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

type BranchFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, String>> + Send>;

/// One named branch of a [`WorkflowContext::parallel`] group.
pub struct Branch {
    name: String,
    run: BranchFn,
}

impl Branch {
    pub fn new<F, Fut, E>(name: &str, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            name: name.to_string(),
            run: Box::new(move || {
                let fut = f();
                Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

struct Journal {
    /// Recorded events grouped by operation index.
    recorded: BTreeMap<u32, Vec<EventPayload>>,
    next_sequence: u64,
}

struct ContextInner<S: WorkflowStore> {
    store: Arc<S>,
    instance_id: Uuid,
    workflow_id: String,
    bus: Option<EventBus>,
    cancel: CancellationToken,
    /// Replay-only mode: never appends, never runs step bodies.
    read_only: bool,
    /// Highest recorded operation index, if any.
    last_recorded_op: Option<u32>,
    next_op: AtomicU32,
    journal: Mutex<Journal>,
}

/// Handle passed to workflow handlers. Cheap to clone.
pub struct WorkflowContext<S: WorkflowStore> {
    inner: Arc<ContextInner<S>>,
}

impl<S: WorkflowStore> Clone for WorkflowContext<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: WorkflowStore + 'static> WorkflowContext<S> {
    pub(crate) fn new(
        store: Arc<S>,
        instance_id: Uuid,
        workflow_id: &str,
        history: &[HistoryEvent],
        bus: Option<EventBus>,
        cancel: CancellationToken,
        read_only: bool,
    ) -> Self {
        let mut recorded: BTreeMap<u32, Vec<EventPayload>> = BTreeMap::new();
        for event in history {
            if let Some(op) = event.payload.op() {
                recorded.entry(op).or_default().push(event.payload.clone());
            }
        }
        let next_sequence = history.last().map(|e| e.sequence + 1).unwrap_or(1);
        let last_recorded_op = recorded.keys().next_back().copied();

        Self {
            inner: Arc::new(ContextInner {
                store,
                instance_id,
                workflow_id: workflow_id.to_string(),
                bus,
                cancel,
                read_only,
                last_recorded_op,
                next_op: AtomicU32::new(0),
                journal: Mutex::new(Journal {
                    recorded,
                    next_sequence,
                }),
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// Whether the next operation will be served from recorded history.
    pub fn is_replaying(&self) -> bool {
        let next = self.inner.next_op.load(Ordering::SeqCst);
        self.inner.last_recorded_op.is_some_and(|last| next <= last)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Run a memoized step with the default policy (single attempt).
    pub fn step<T, E, F, Fut>(
        &self,
        name: &str,
        f: F,
    ) -> impl Future<Output = Result<T, FlowError>> + Send + use<T, E, F, Fut, S>
    where
        T: Serialize + DeserializeOwned + Send,
        E: fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.step_with(name, RetryPolicy::none(), f)
    }

    /// Run a memoized step, retrying failed attempts per `policy`.
    ///
    /// Exactly one `STEP_COMPLETED` or `STEP_FAILED` is recorded, after all
    /// attempts. On replay the recorded output (or failure) is returned and
    /// `f` is not called.
    pub fn step_with<T, E, F, Fut>(
        &self,
        name: &str,
        policy: RetryPolicy,
        f: F,
    ) -> impl Future<Output = Result<T, FlowError>> + Send + use<T, E, F, Fut, S>
    where
        T: Serialize + DeserializeOwned + Send,
        E: fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let op = self.next_op();
        let ctx = self.clone();
        let name = name.to_string();
        async move { ctx.run_step(op, name, policy, f).await }
    }

    /// Run a group of steps concurrently.
    ///
    /// Operation indexes are assigned in branch order and completion events
    /// are appended in that order regardless of which branch finished first.
    /// Returns the outputs in branch order, or the first branch failure.
    pub fn parallel(
        &self,
        branches: Vec<Branch>,
    ) -> impl Future<Output = Result<Vec<Value>, FlowError>> + Send + use<S> {
        let ops: Vec<u32> = branches.iter().map(|_| self.next_op()).collect();
        let ctx = self.clone();
        async move { ctx.run_parallel(ops, branches).await }
    }

    /// Durably sleep. Suspends the instance until the timer sweep fires.
    pub fn sleep<D>(&self, duration: D) -> impl Future<Output = Result<(), FlowError>> + Send + use<D, S>
    where
        D: IntoWaitDuration + Send,
    {
        let op = self.next_op();
        let ctx = self.clone();
        async move { ctx.run_sleep(op, duration).await }
    }

    /// Wait for a signal named `event_name`.
    ///
    /// Resolves to the signal payload, or to `{"timeout": true}` when the
    /// configured timeout fires first.
    pub fn wait_for_event(
        &self,
        event_name: &str,
        options: WaitOptions,
    ) -> impl Future<Output = Result<Value, FlowError>> + Send + use<S> {
        let op = self.next_op();
        let ctx = self.clone();
        let event_name = event_name.to_string();
        async move { ctx.run_wait(op, event_name, options).await }
    }

    // -----------------------------------------------------------------------
    // Journal
    // -----------------------------------------------------------------------

    fn next_op(&self) -> u32 {
        self.inner.next_op.fetch_add(1, Ordering::SeqCst)
    }

    async fn recorded(&self, op: u32) -> Option<Vec<EventPayload>> {
        self.inner.journal.lock().await.recorded.get(&op).cloned()
    }

    /// Append events with the next sequence numbers.
    pub(crate) async fn append(&self, payloads: Vec<EventPayload>) -> Result<(), FlowError> {
        if self.inner.read_only {
            return Err(FlowError::failed("replay verification cannot append events"));
        }
        let mut journal = self.inner.journal.lock().await;
        let events: Vec<HistoryEvent> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                HistoryEvent::new(
                    self.inner.instance_id,
                    journal.next_sequence + i as u64,
                    payload,
                )
            })
            .collect();
        self.inner
            .store
            .append_events(&self.inner.instance_id, &events)
            .await?;
        journal.next_sequence += events.len() as u64;
        Ok(())
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.inner.bus {
            bus.publish(event);
        }
    }

    /// Check the first recorded event of `op` against the requested operation.
    fn expect_op(
        &self,
        op: u32,
        recorded: &[EventPayload],
        kind: OpKind,
        name: &str,
    ) -> Result<(), FlowError> {
        let Some(first) = recorded.first() else {
            return Ok(());
        };
        let recorded_kind = OpKind::of(first.event_type());
        let recorded_name = first.op_name().unwrap_or_default();
        if recorded_kind == Some(kind) && recorded_name == name {
            return Ok(());
        }
        Err(FlowError::NonDeterministic {
            op,
            recorded: format!("{} '{}'", first.event_type(), recorded_name),
            requested: format!("{kind} '{name}'"),
        })
    }

    fn diverged(&self, op: u32, kind: OpKind, name: &str) -> FlowError {
        FlowError::NonDeterministic {
            op,
            recorded: "end of history".to_string(),
            requested: format!("{kind} '{name}'"),
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn cancel_reason(&self) -> Result<Option<String>, FlowError> {
        let instance = self
            .inner
            .store
            .get_instance(&self.inner.instance_id)
            .await?;
        Ok(instance.and_then(|i| i.cancel_reason))
    }

    /// Enforce a pending cancellation at an operation boundary.
    async fn check_cancelled(&self) -> Result<(), FlowError> {
        if let Some(reason) = self.cancel_reason().await? {
            return Err(FlowError::Cancelled(reason));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(FlowError::Cancelled("cancelled".to_string()));
        }
        Ok(())
    }

    async fn cancelled_error(&self) -> FlowError {
        match self.cancel_reason().await {
            Ok(Some(reason)) => FlowError::Cancelled(reason),
            Ok(None) => FlowError::Cancelled("cancelled".to_string()),
            Err(e) => e,
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn run_step<T, E, F, Fut>(
        &self,
        op: u32,
        name: String,
        policy: RetryPolicy,
        mut f: F,
    ) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned + Send,
        E: fmt::Display + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let mut started = false;
        if let Some(recorded) = self.recorded(op).await {
            self.expect_op(op, &recorded, OpKind::Step, &name)?;
            if let Some(result) = recorded_step_result(&name, &recorded) {
                return result.and_then(|output| decode_output(&name, output));
            }
            // Started but never finished (the previous run stopped mid-step).
            started = true;
        }
        if self.inner.read_only {
            return Err(self.diverged(op, OpKind::Step, &name));
        }

        self.check_cancelled().await?;
        if !started {
            self.append(vec![EventPayload::StepStarted {
                op,
                name: name.clone(),
            }])
            .await?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let message = match f().await {
                Ok(value) => {
                    let output = serde_json::to_value(&value).map_err(|e| {
                        FlowError::failed(format!("step '{name}' output is not serializable: {e}"))
                    })?;
                    self.append(vec![EventPayload::StepCompleted {
                        op,
                        name: name.clone(),
                        output,
                    }])
                    .await?;
                    tracing::debug!(
                        instance_id = %self.inner.instance_id,
                        step = %name,
                        attempt,
                        "step completed"
                    );
                    self.publish(EngineEvent::StepCompleted {
                        instance_id: self.inner.instance_id,
                        step: name,
                        attempts: attempt,
                    });
                    return Ok(value);
                }
                Err(e) => e.to_string(),
            };

            if RetryHandler::should_retry(&policy, attempt) {
                let delay = RetryHandler::delay_after(&policy, attempt);
                tracing::warn!(
                    instance_id = %self.inner.instance_id,
                    step = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "step attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.inner.cancel.cancelled() => {
                        return Err(self.cancelled_error().await);
                    }
                }
                continue;
            }

            self.append(vec![EventPayload::StepFailed {
                op,
                name: name.clone(),
                error: message.clone(),
                attempts: attempt,
            }])
            .await?;
            tracing::warn!(
                instance_id = %self.inner.instance_id,
                step = %name,
                attempts = attempt,
                error = %message,
                "step failed"
            );
            self.publish(EngineEvent::StepFailed {
                instance_id: self.inner.instance_id,
                step: name.clone(),
                error: message.clone(),
                attempts: attempt,
            });
            return Err(FlowError::StepFailed {
                step: name,
                message,
                attempts: attempt,
            });
        }
    }

    async fn run_parallel(&self, ops: Vec<u32>, branches: Vec<Branch>) -> Result<Vec<Value>, FlowError> {
        let mut results: Vec<Option<Result<Value, FlowError>>> = Vec::with_capacity(branches.len());
        // (slot, op, name, already started, body)
        let mut live: Vec<(usize, u32, String, bool, BranchFn)> = Vec::new();

        for (slot, (op, branch)) in ops.into_iter().zip(branches).enumerate() {
            match self.recorded(op).await {
                Some(recorded) => {
                    self.expect_op(op, &recorded, OpKind::Step, &branch.name)?;
                    match recorded_step_result(&branch.name, &recorded) {
                        Some(result) => results.push(Some(result)),
                        None => {
                            results.push(None);
                            live.push((slot, op, branch.name, true, branch.run));
                        }
                    }
                }
                None => {
                    results.push(None);
                    live.push((slot, op, branch.name, false, branch.run));
                }
            }
        }

        if !live.is_empty() {
            if self.inner.read_only {
                let (_, op, name, _, _) = &live[0];
                return Err(self.diverged(*op, OpKind::Step, name));
            }
            self.check_cancelled().await?;

            let starts: Vec<EventPayload> = live
                .iter()
                .filter(|(_, _, _, started, _)| !started)
                .map(|(_, op, name, _, _)| EventPayload::StepStarted {
                    op: *op,
                    name: name.clone(),
                })
                .collect();
            if !starts.is_empty() {
                self.append(starts).await?;
            }

            let mut meta = Vec::with_capacity(live.len());
            let mut futures = Vec::with_capacity(live.len());
            for (slot, op, name, _, run) in live {
                meta.push((slot, op, name));
                futures.push(run());
            }
            let outcomes = join_all(futures).await;

            let mut completions = Vec::with_capacity(outcomes.len());
            for ((slot, op, name), outcome) in meta.into_iter().zip(outcomes) {
                match outcome {
                    Ok(output) => {
                        completions.push(EventPayload::StepCompleted {
                            op,
                            name: name.clone(),
                            output: output.clone(),
                        });
                        self.publish(EngineEvent::StepCompleted {
                            instance_id: self.inner.instance_id,
                            step: name,
                            attempts: 1,
                        });
                        results[slot] = Some(Ok(output));
                    }
                    Err(message) => {
                        completions.push(EventPayload::StepFailed {
                            op,
                            name: name.clone(),
                            error: message.clone(),
                            attempts: 1,
                        });
                        self.publish(EngineEvent::StepFailed {
                            instance_id: self.inner.instance_id,
                            step: name.clone(),
                            error: message.clone(),
                            attempts: 1,
                        });
                        results[slot] = Some(Err(FlowError::StepFailed {
                            step: name,
                            message,
                            attempts: 1,
                        }));
                    }
                }
            }
            self.append(completions).await?;
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(FlowError::failed("parallel branch produced no result"))))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sleep
    // -----------------------------------------------------------------------

    async fn run_sleep<D: IntoWaitDuration>(&self, op: u32, duration: D) -> Result<(), FlowError> {
        let suspended = || FlowError::Suspended {
            waiting_for: SLEEP_EVENT.to_string(),
            token: None,
        };

        if let Some(recorded) = self.recorded(op).await {
            self.expect_op(op, &recorded, OpKind::Sleep, SLEEP_NAME)?;
            if recorded
                .iter()
                .any(|e| e.event_type() == EventType::SleepCompleted)
            {
                return Ok(());
            }
            return Err(suspended());
        }
        if self.inner.read_only {
            return Err(self.diverged(op, OpKind::Sleep, SLEEP_NAME));
        }

        let duration = duration.into_wait_duration()?;
        self.check_cancelled().await?;

        let fire_at = deadline_after(duration)?;
        self.append(vec![EventPayload::SleepStarted {
            op,
            name: SLEEP_NAME.to_string(),
            fire_at,
        }])
        .await?;
        self.inner
            .store
            .create_timer(&Timer {
                id: Uuid::now_v7(),
                instance_id: self.inner.instance_id,
                op,
                kind: TimerKind::Sleep,
                fire_at,
            })
            .await?;

        tracing::debug!(
            instance_id = %self.inner.instance_id,
            op,
            fire_at = %fire_at,
            "sleeping"
        );
        Err(suspended())
    }

    // -----------------------------------------------------------------------
    // Wait for event
    // -----------------------------------------------------------------------

    async fn run_wait(
        &self,
        op: u32,
        event_name: String,
        options: WaitOptions,
    ) -> Result<Value, FlowError> {
        if let Some(recorded) = self.recorded(op).await {
            self.expect_op(op, &recorded, OpKind::Wait, &event_name)?;
            let mut token = None;
            for event in &recorded {
                match event {
                    EventPayload::EventReceived { payload, .. } => return Ok(payload.clone()),
                    EventPayload::EventWaiting { token: t, .. } => token = t.clone(),
                    _ => {}
                }
            }
            if !self.inner.read_only {
                if let Some(payload) = self.consume_signal(op, &event_name, token.as_deref()).await? {
                    return Ok(payload);
                }
            }
            return Err(FlowError::Suspended {
                waiting_for: event_name,
                token,
            });
        }
        if self.inner.read_only {
            return Err(self.diverged(op, OpKind::Wait, &event_name));
        }

        let timeout = options.timeout.transpose().map_err(FlowError::Failed)?;
        self.check_cancelled().await?;

        let timeout_at = timeout.map(deadline_after).transpose()?;
        self.append(vec![EventPayload::EventWaiting {
            op,
            event_name: event_name.clone(),
            token: options.token.clone(),
            timeout_at,
        }])
        .await?;
        if let Some(fire_at) = timeout_at {
            self.inner
                .store
                .create_timer(&Timer {
                    id: Uuid::now_v7(),
                    instance_id: self.inner.instance_id,
                    op,
                    kind: TimerKind::EventTimeout {
                        event_name: event_name.clone(),
                    },
                    fire_at,
                })
                .await?;
        }

        // A signal may already be waiting (e.g. a job callback that beat us).
        if let Some(payload) = self
            .consume_signal(op, &event_name, options.token.as_deref())
            .await?
        {
            return Ok(payload);
        }

        tracing::debug!(
            instance_id = %self.inner.instance_id,
            op,
            event = %event_name,
            "waiting for event"
        );
        Err(FlowError::Suspended {
            waiting_for: event_name,
            token: options.token,
        })
    }

    /// Consume the oldest matching pending signal into an `EVENT_RECEIVED`.
    async fn consume_signal(
        &self,
        op: u32,
        event_name: &str,
        token: Option<&str>,
    ) -> Result<Option<Value>, FlowError> {
        let store = &self.inner.store;
        let pending = store
            .get_pending_signals(&self.inner.instance_id, event_name)
            .await?;
        for signal in pending {
            if let (Some(want), Some(got)) = (token, signal.token.as_deref()) {
                if want != got {
                    continue;
                }
            }
            // Record before consuming so a failed append leaves the signal pending.
            self.append(vec![EventPayload::EventReceived {
                op,
                event_name: event_name.to_string(),
                payload: signal.payload.clone(),
                timed_out: false,
            }])
            .await?;
            store.mark_signal_processed(&signal.id).await?;
            store
                .delete_timers_for_instance(&self.inner.instance_id)
                .await?;
            tracing::debug!(
                instance_id = %self.inner.instance_id,
                signal_id = %signal.id,
                event = %event_name,
                "signal consumed"
            );
            return Ok(Some(signal.payload));
        }
        Ok(None)
    }
}

/// The terminal result recorded for a step, if it finished.
/// Wall-clock instant `duration` from now; out-of-range durations fail the run.
fn deadline_after(duration: Duration) -> Result<DateTime<Utc>, FlowError> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| FlowError::failed(format!("duration {duration:?} is out of range")))
}

fn recorded_step_result(name: &str, recorded: &[EventPayload]) -> Option<Result<Value, FlowError>> {
    recorded.iter().find_map(|event| match event {
        EventPayload::StepCompleted { output, .. } => Some(Ok(output.clone())),
        EventPayload::StepFailed {
            error, attempts, ..
        } => Some(Err(FlowError::StepFailed {
            step: name.to_string(),
            message: error.clone(),
            attempts: *attempts,
        })),
        _ => None,
    })
}

fn decode_output<T: DeserializeOwned>(name: &str, output: Value) -> Result<T, FlowError> {
    serde_json::from_value(output)
        .map_err(|e| FlowError::failed(format!("recorded output of step '{name}' does not decode: {e}")))
}
