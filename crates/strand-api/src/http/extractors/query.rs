//! Query parameter extractors for list endpoints.

use serde::Deserialize;

const DEFAULT_LIMIT: u32 = 50;

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

/// Query parameters for the instance list endpoint.
#[derive(Debug, Deserialize)]
pub struct InstanceListQuery {
    /// Filter by status (pending, running, suspended, completed, failed, cancelled).
    pub status: Option<String>,
    /// Maximum results.
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// Query parameters for the job list endpoint.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    /// Filter by worker id.
    #[serde(rename = "workerId")]
    pub worker_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for InstanceListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Default for JobListQuery {
    fn default() -> Self {
        Self {
            worker_id: None,
            limit: DEFAULT_LIMIT,
        }
    }
}
