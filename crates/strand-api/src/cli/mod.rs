//! CLI command definitions for the `strand` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (`strand workflow start`, `strand job dispatch`, ...).

pub mod instance;
pub mod job;
pub mod queue;
pub mod signal;
pub mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::{StyledObject, style};
use serde_json::Value;

use instance::InstanceCommand;
use job::JobCommand;
use queue::QueueCommand;
use signal::SignalCommand;
use workflow::WorkflowCommand;

/// Durable workflows and background jobs.
#[derive(Parser)]
#[command(name = "strand", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Registered workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },

    /// Workflow instances.
    #[command(alias = "inst")]
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },

    /// Deliver signals to waiting instances.
    Signal {
        #[command(subcommand)]
        command: SignalCommand,
    },

    /// Background jobs and workers.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Worker chains.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Fire due timers once and exit.
    Sweep {
        /// Maximum timers to process.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Start the REST API server with the timer sweeper.
    Serve {
        /// Port to listen on (defaults to `server.port`).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to `server.host`).
        #[arg(long)]
        host: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse an optional JSON argument; absent means `null`.
pub(crate) fn parse_json_arg(raw: Option<&str>, what: &str) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON {what}")),
        None => Ok(Value::Null),
    }
}

/// Color a status string the same way across commands.
pub(crate) fn styled_status(status: &str) -> StyledObject<String> {
    let s = status.to_string();
    match status {
        "completed" | "success" => style(s).green(),
        "failed" | "error" => style(s).red(),
        "cancelled" | "partial" => style(s).yellow(),
        "suspended" | "queued" | "pending" => style(s).cyan(),
        _ => style(s).dim(),
    }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["strand", "job", "list", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Job { .. }));
    }

    #[test]
    fn json_args() {
        assert_eq!(parse_json_arg(None, "input").unwrap(), Value::Null);
        assert_eq!(
            parse_json_arg(Some(r#"{"a":1}"#), "input").unwrap(),
            serde_json::json!({"a": 1})
        );
        assert!(parse_json_arg(Some("{oops"), "input").is_err());
    }
}
