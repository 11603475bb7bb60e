//! Workflow domain types for Strand.
//!
//! Defines the durable state of a workflow execution: the `WorkflowInstance`
//! row, the append-only `HistoryEvent` log that replay is driven from, and the
//! `Signal` / `Timer` records the scheduler uses to park and wake instances.
//! Step retry configuration lives here as well since it is part of the
//! handler-facing contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `waiting_for_event` value of an instance parked on a `sleep`.
///
/// Reserved: signals may not use this name.
pub const SLEEP_EVENT: &str = "__sleep";

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// `Pending -> Running -> (Suspended -> Running)* -> Completed | Failed | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Whether this status is final. Terminal instances are never re-executed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Storage representation (matches the serde name).
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "suspended" => Ok(InstanceStatus::Suspended),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One durable execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// ID of the registered workflow definition.
    pub workflow_id: String,
    /// Definition version the instance was started with.
    pub version: String,
    pub status: InstanceStatus,
    /// Original input payload.
    pub input: Value,
    /// Final result (set when `Completed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message (set when `Failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Event the instance is blocked on (set when `Suspended`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_event: Option<String>,
    /// Correlation token of the current wait, if the wait declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_token: Option<String>,
    /// Cancellation reason (requested or recorded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Build a fresh `Pending` instance.
    pub fn new(id: Uuid, workflow_id: &str, version: &str, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id: workflow_id.to_string(),
            version: version.to_string(),
            status: InstanceStatus::Pending,
            input,
            result: None,
            error: None,
            waiting_for_event: None,
            wait_token: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Fields written alongside a status change.
///
/// `waiting_for_event` and `wait_token` are always overwritten (cleared when
/// `None`); the other fields are only written when `Some`.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub result: Option<Value>,
    pub error: Option<String>,
    pub waiting_for_event: Option<String>,
    pub wait_token: Option<String>,
    pub cancel_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// History events
// ---------------------------------------------------------------------------

/// Discriminant of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    EventWaiting,
    EventReceived,
    SleepStarted,
    SleepCompleted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "WORKFLOW_STARTED",
            EventType::StepStarted => "STEP_STARTED",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::StepFailed => "STEP_FAILED",
            EventType::EventWaiting => "EVENT_WAITING",
            EventType::EventReceived => "EVENT_RECEIVED",
            EventType::SleepStarted => "SLEEP_STARTED",
            EventType::SleepCompleted => "SLEEP_COMPLETED",
            EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            EventType::WorkflowFailed => "WORKFLOW_FAILED",
            EventType::WorkflowCancelled => "WORKFLOW_CANCELLED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event body, internally tagged by `type`.
///
/// Operation-scoped variants carry `op`, the index the context assigned to
/// the operation in handler call order, and the operation name. Together they
/// form the replay key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    WorkflowStarted {
        input: Value,
    },
    StepStarted {
        op: u32,
        name: String,
    },
    StepCompleted {
        op: u32,
        name: String,
        output: Value,
    },
    StepFailed {
        op: u32,
        name: String,
        error: String,
        attempts: u32,
    },
    EventWaiting {
        op: u32,
        event_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_at: Option<DateTime<Utc>>,
    },
    EventReceived {
        op: u32,
        event_name: String,
        payload: Value,
        #[serde(default)]
        timed_out: bool,
    },
    SleepStarted {
        op: u32,
        name: String,
        fire_at: DateTime<Utc>,
    },
    SleepCompleted {
        op: u32,
        name: String,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        error: String,
    },
    WorkflowCancelled {
        reason: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::WorkflowStarted { .. } => EventType::WorkflowStarted,
            EventPayload::StepStarted { .. } => EventType::StepStarted,
            EventPayload::StepCompleted { .. } => EventType::StepCompleted,
            EventPayload::StepFailed { .. } => EventType::StepFailed,
            EventPayload::EventWaiting { .. } => EventType::EventWaiting,
            EventPayload::EventReceived { .. } => EventType::EventReceived,
            EventPayload::SleepStarted { .. } => EventType::SleepStarted,
            EventPayload::SleepCompleted { .. } => EventType::SleepCompleted,
            EventPayload::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            EventPayload::WorkflowFailed { .. } => EventType::WorkflowFailed,
            EventPayload::WorkflowCancelled { .. } => EventType::WorkflowCancelled,
        }
    }

    /// Operation index, for operation-scoped events.
    pub fn op(&self) -> Option<u32> {
        match self {
            EventPayload::StepStarted { op, .. }
            | EventPayload::StepCompleted { op, .. }
            | EventPayload::StepFailed { op, .. }
            | EventPayload::EventWaiting { op, .. }
            | EventPayload::EventReceived { op, .. }
            | EventPayload::SleepStarted { op, .. }
            | EventPayload::SleepCompleted { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Operation name (step name, sleep label, or event name).
    pub fn op_name(&self) -> Option<&str> {
        match self {
            EventPayload::StepStarted { name, .. }
            | EventPayload::StepCompleted { name, .. }
            | EventPayload::StepFailed { name, .. }
            | EventPayload::SleepStarted { name, .. }
            | EventPayload::SleepCompleted { name, .. } => Some(name),
            EventPayload::EventWaiting { event_name, .. }
            | EventPayload::EventReceived { event_name, .. } => Some(event_name),
            _ => None,
        }
    }
}

/// An immutable, sequence-numbered entry in an instance's event log.
///
/// Sequences start at 1 and increase by exactly one per appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub instance_id: Uuid,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl HistoryEvent {
    pub fn new(instance_id: Uuid, sequence: u64, payload: EventPayload) -> Self {
        Self {
            instance_id,
            sequence,
            recorded_at: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

// ---------------------------------------------------------------------------
// Signals and timers
// ---------------------------------------------------------------------------

/// An externally delivered named event addressed to one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub payload: Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// What a timer completes when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// A `sleep` operation; firing appends `SLEEP_COMPLETED`.
    Sleep,
    /// The timeout of a `wait_for_event`; firing delivers `{"timeout": true}`.
    EventTimeout { event_name: String },
}

/// A persisted wake-up for a suspended instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Operation index the timer completes.
    pub op: u32,
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Delay growth between step attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Retry policy for a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 1, no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Delay before the second attempt in milliseconds (default 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds (default 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::Fixed,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            initial_delay_ms: delay_ms,
            ..Self::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            initial_delay_ms,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Suspended,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            let parsed: InstanceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            let via_serde = serde_json::to_value(status).unwrap();
            assert_eq!(via_serde, json!(status.as_str()));
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn history_event_serializes_flat_with_type_tag() {
        let event = HistoryEvent::new(
            Uuid::nil(),
            3,
            EventPayload::StepCompleted {
                op: 0,
                name: "fetch".to_string(),
                output: json!({"rows": 2}),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "STEP_COMPLETED");
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["op"], 0);
        assert_eq!(value["output"]["rows"], 2);

        let back: HistoryEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn payload_accessors() {
        let waiting = EventPayload::EventWaiting {
            op: 4,
            event_name: "approve".to_string(),
            token: None,
            timeout_at: None,
        };
        assert_eq!(waiting.event_type(), EventType::EventWaiting);
        assert_eq!(waiting.op(), Some(4));
        assert_eq!(waiting.op_name(), Some("approve"));

        let done = EventPayload::WorkflowCompleted { result: json!(1) };
        assert_eq!(done.op(), None);
        assert_eq!(done.event_type().as_str(), "WORKFLOW_COMPLETED");
    }

    #[test]
    fn event_received_defaults_timed_out_to_false() {
        let value = json!({
            "type": "EVENT_RECEIVED",
            "op": 1,
            "event_name": "approve",
            "payload": {"approved": true}
        });
        let payload: EventPayload = serde_json::from_value(value).unwrap();
        match payload {
            EventPayload::EventReceived { timed_out, .. } => assert!(!timed_out),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn timer_kind_tagging() {
        let kind = TimerKind::EventTimeout {
            event_name: "approve".to_string(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value, json!({"type": "event_timeout", "event_name": "approve"}));
        assert_eq!(serde_json::to_value(TimerKind::Sleep).unwrap(), json!({"type": "sleep"}));
    }

    #[test]
    fn retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy, RetryPolicy::none());
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff, Backoff::Fixed);

        let policy: RetryPolicy =
            serde_json::from_value(json!({"max_attempts": 4, "backoff": "exponential"})).unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.initial_delay_ms, 1_000);
    }

    #[test]
    fn new_instance_is_pending() {
        let instance = WorkflowInstance::new(Uuid::now_v7(), "onboarding", "1", json!({"user": 7}));
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert!(instance.result.is_none());
        assert!(instance.waiting_for_event.is_none());
    }
}
