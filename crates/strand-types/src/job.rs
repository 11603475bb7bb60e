//! Background job types.
//!
//! A `JobRecord` is the persisted state of one dispatched worker invocation.
//! Its serialized form is the job status wire format (`_id`, `workerId`,
//! `progressPct`, ...), so it is camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata key under which queue chaining state travels with a job.
pub const QUEUE_CONTEXT_KEY: &str = "queueContext";

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: Some(name.into()),
            stack: None,
        }
    }
}

/// One log line appended by a running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Persisted status record of a dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub worker_id: String,
    pub status: JobStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Completion percentage, always within 0..=100.
    #[serde(rename = "progressPct")]
    pub progress: u8,
    #[serde(default)]
    pub logs: Vec<JobLog>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh `queued` record.
    pub fn queued(
        id: Uuid,
        worker_id: &str,
        input: Value,
        metadata: Value,
        webhook_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            worker_id: worker_id.to_string(),
            status: JobStatus::Queued,
            input,
            output: None,
            error: None,
            progress: 0,
            logs: Vec::new(),
            metadata,
            webhook_url,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Queue chaining state, if this job is a queue step.
    pub fn queue_context(&self) -> Option<QueueContext> {
        self.metadata
            .get(QUEUE_CONTEXT_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Clamp a reported progress value into 0..=100.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Where a dispatched job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// In this process.
    Local,
    /// Through the configured trigger endpoint.
    Remote,
    /// Remote when a trigger URL is configured, else local.
    #[default]
    Auto,
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DispatchMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Extra metadata stored on the record (must be an object when set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Body posted to `POST /workers/trigger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub worker_id: String,
    pub body: TriggerBody,
}

/// The job envelope inside a trigger request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBody {
    pub worker_id: String,
    pub job_id: Uuid,
    pub input: Value,
    /// Caller-side execution context (origin, dispatch mode).
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Response of the trigger endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub message_id: String,
    pub job_id: Uuid,
}

/// Payload posted to a job's `webhookUrl` when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCallback {
    pub job_id: Uuid,
    pub worker_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WebhookCallback {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            worker_id: record.worker_id.clone(),
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
            metadata: match &record.metadata {
                Value::Null => None,
                other => Some(other.clone()),
            },
        }
    }

    /// Signal name a callback is delivered under.
    pub fn signal_name(&self) -> String {
        format!("job:{}", self.job_id)
    }
}

/// Summary of a registered worker, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Queue context
// ---------------------------------------------------------------------------

/// Chaining state embedded in a queue step's job metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueContext {
    /// Queue config ID.
    pub id: String,
    pub step_index: usize,
    pub initial_input: Value,
    pub queue_job_id: Uuid,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
