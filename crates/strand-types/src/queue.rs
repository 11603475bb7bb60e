//! Queue (worker chain) types.
//!
//! A `QueueConfig` is an ordered list of worker steps. A `QueueJob` is one
//! run of a queue and tracks the job dispatched for each step.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::JobStatus;

// ---------------------------------------------------------------------------
// Queue configuration
// ---------------------------------------------------------------------------

/// What happens to the rest of a queue when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Keep dispatching; the queue job ends `partial`.
    #[default]
    Continue,
    /// Stop the queue; the queue job ends `failed`.
    Abort,
}

/// Signature of a code-defined input mapping: `(prev_output, initial_input) -> input`.
pub type MapInputFn = dyn Fn(&Value, &Value) -> Value + Send + Sync;

/// How a step's input is derived from the previous step's output.
#[derive(Clone)]
pub enum InputMap {
    /// Declarative `target_path -> source_path` map.
    ///
    /// Sources are `prev`, `prev.<path>`, `initial` or `initial.<path>`.
    /// Targets are dotted paths into a fresh object; an empty target (`""`)
    /// replaces the whole input.
    Fields(BTreeMap<String, String>),
    /// Arbitrary mapping closure. Only available to code-registered queues.
    Custom(Arc<MapInputFn>),
}

impl InputMap {
    pub fn fields<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        InputMap::Fields(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        InputMap::Custom(Arc::new(f))
    }
}

impl fmt::Debug for InputMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMap::Fields(map) => f.debug_tuple("Fields").field(map).finish(),
            InputMap::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl Serialize for InputMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InputMap::Fields(map) => map.serialize(serializer),
            InputMap::Custom(_) => serializer.serialize_str("<custom>"),
        }
    }
}

impl<'de> Deserialize<'de> for InputMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(InputMap::Fields)
    }
}

/// One step of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStep {
    pub worker_id: String,
    /// Delay before this step is dispatched, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_input_from_prev: Option<InputMap>,
}

impl QueueStep {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            delay_seconds: None,
            map_input_from_prev: None,
        }
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_map(mut self, map: InputMap) -> Self {
        self.map_input_from_prev = Some(map);
        self
    }
}

/// A named, ordered chain of worker steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub id: String,
    pub steps: Vec<QueueStep>,
    /// Informational schedule expression; not evaluated by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

// ---------------------------------------------------------------------------
// Queue job (one run of a queue)
// ---------------------------------------------------------------------------

/// Aggregate status of a queue run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueJobStatus {
    Running,
    /// Every step succeeded.
    Completed,
    /// Every step ran but at least one failed.
    Partial,
    /// A step failed and the queue aborted.
    Failed,
}

impl QueueJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueJobStatus::Running => "running",
            QueueJobStatus::Completed => "completed",
            QueueJobStatus::Partial => "partial",
            QueueJobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, QueueJobStatus::Running)
    }
}

impl std::str::FromStr for QueueJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(QueueJobStatus::Running),
            "completed" => Ok(QueueJobStatus::Completed),
            "partial" => Ok(QueueJobStatus::Partial),
            "failed" => Ok(QueueJobStatus::Failed),
            other => Err(format!("invalid queue job status: '{other}'")),
        }
    }
}

/// Per-step state within a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStepStatus {
    /// Not dispatched yet (possibly waiting out its delay).
    Pending,
    /// A job exists for this step.
    Dispatched,
    Success,
    Error,
    /// Never ran because the queue aborted.
    Skipped,
}

impl QueueStepStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            QueueStepStatus::Success | QueueStepStatus::Error | QueueStepStatus::Skipped
        )
    }
}

/// The job reference and state of one queue step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJobStep {
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub status: QueueStepStatus,
}

/// One run of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: Uuid,
    pub queue_id: String,
    pub status: QueueJobStatus,
    pub initial_input: Value,
    pub steps: Vec<QueueJobStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// A fresh running queue job with every step pending.
    pub fn start(id: Uuid, config: &QueueConfig, initial_input: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            queue_id: config.id.clone(),
            status: QueueJobStatus::Running,
            initial_input,
            steps: config
                .steps
                .iter()
                .map(|s| QueueJobStep {
                    worker_id: s.worker_id.clone(),
                    job_id: None,
                    status: QueueStepStatus::Pending,
                })
                .collect(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

impl From<JobStatus> for QueueStepStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued | JobStatus::Running => QueueStepStatus::Dispatched,
            JobStatus::Success => QueueStepStatus::Success,
            JobStatus::Error => QueueStepStatus::Error,
        }
    }
}

/// Result of dispatching a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDispatchReceipt {
    /// Job ID of the first step.
    pub job_id: Uuid,
    pub queue_id: String,
    pub queue_job_id: Uuid,
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
