//! Global configuration types for Strand.
//!
//! `StrandConfig` represents the top-level `config.toml` in the data
//! directory. Every section and field has a default, so an empty file (or no
//! file at all) is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::job::DispatchMode;

/// Top-level configuration for the Strand host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrandConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Timer sweep and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between timer sweeps in milliseconds.
    #[serde(default = "default_timer_sweep_interval_ms")]
    pub timer_sweep_interval_ms: u64,
    /// Maximum due timers handled per sweep.
    #[serde(default = "default_timer_batch_size")]
    pub timer_batch_size: u32,
    /// Seconds without an update after which a `Running` instance no run
    /// holds is recovered from its history.
    #[serde(default = "default_recover_after_secs")]
    pub recover_after_secs: u64,
}

fn default_timer_sweep_interval_ms() -> u64 {
    1_000
}

fn default_timer_batch_size() -> u32 {
    100
}

fn default_recover_after_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_sweep_interval_ms: default_timer_sweep_interval_ms(),
            timer_batch_size: default_timer_batch_size(),
            recover_after_secs: default_recover_after_secs(),
        }
    }
}

/// Job dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    /// Base URL of the remote execution backend (`{trigger_url}/workers/trigger`).
    #[serde(default)]
    pub trigger_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Auto,
            trigger_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Webhook callback signing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC-SHA256 secret for signing and verifying job callbacks.
    #[serde(default)]
    pub secret: Option<String>,
    /// Accept callbacks without a signature when no secret is configured.
    #[serde(default)]
    pub allow_unsigned_callbacks: bool,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
