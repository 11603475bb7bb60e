//! CLI workflow subcommands: list definitions, start instances.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use strand_core::workflow::{EngineError, WorkflowOutcome};
use uuid::Uuid;

use crate::cli::{parse_json_arg, print_json, styled_status};
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Start a workflow instance and run it until it completes or suspends.
    Start {
        /// Workflow id.
        workflow_id: String,

        /// JSON input.
        #[arg(long)]
        input: Option<String>,

        /// Use this instance id instead of generating one.
        #[arg(long)]
        instance_id: Option<Uuid>,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::List => handle_list(state, json),
        WorkflowCommand::Start {
            workflow_id,
            input,
            instance_id,
        } => handle_start(&workflow_id, input.as_deref(), instance_id, state, json).await,
    }
}

fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let mut workflows = state.engine.registry().list();
    workflows.sort();

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|(id, version)| serde_json::json!({"id": id, "version": version}))
            .collect();
        return print_json(&out);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Workflow").fg(Color::Cyan), Cell::new("Version")]);
    for (id, version) in &workflows {
        table.add_row(vec![Cell::new(id), Cell::new(version)]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_start(
    workflow_id: &str,
    input: Option<&str>,
    instance_id: Option<Uuid>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let input = parse_json_arg(input, "input")?;
    let (id, outcome) = match state.engine.start(workflow_id, input, instance_id).await {
        Ok(started) => started,
        Err(EngineError::WorkflowFailed { instance_id, message }) => {
            (instance_id, WorkflowOutcome::Failed { error: message })
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        return print_json(&serde_json::json!({"instanceId": id, "outcome": outcome}));
    }

    println!();
    println!(
        "  {} Started '{}'",
        style("*").green().bold(),
        style(workflow_id).cyan()
    );
    println!("  Instance: {id}");
    print_outcome(&outcome);
    println!();
    Ok(())
}

/// Describe where an execution left an instance.
pub(crate) fn print_outcome(outcome: &WorkflowOutcome) {
    let status = outcome.status();
    println!("  Status: {}", styled_status(status.as_str()));
    match outcome {
        WorkflowOutcome::Completed { result } => {
            println!("  Result: {result}");
        }
        WorkflowOutcome::Suspended { waiting_for, token } => {
            println!("  Waiting for: {}", style(waiting_for).cyan());
            if let Some(token) = token {
                println!("  Token: {token}");
            }
        }
        WorkflowOutcome::Cancelled { reason } => {
            println!("  Reason: {reason}");
        }
        WorkflowOutcome::Failed { error } => {
            println!("  Error: {}", style(error).red());
        }
    }
}
