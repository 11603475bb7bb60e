//! CLI instance subcommands: list, show, resume, cancel, verify, recover.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use strand_core::workflow::{CancelOutcome, EngineError, WorkflowOutcome};
use strand_types::workflow::InstanceStatus;
use uuid::Uuid;

use crate::cli::workflow::print_outcome;
use crate::cli::{print_json, styled_status};
use crate::state::AppState;

/// Workflow instance subcommands.
#[derive(Subcommand)]
pub enum InstanceCommand {
    /// List instances, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, running, suspended, completed, failed, cancelled).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show an instance and its event history.
    Show {
        id: Uuid,
    },

    /// Re-execute a suspended instance.
    Resume {
        id: Uuid,
    },

    /// Cancel an instance.
    Cancel {
        id: Uuid,

        #[arg(long, default_value = "cancelled from CLI")]
        reason: String,
    },

    /// Replay an instance's history and compare with its recorded outcome.
    Verify {
        id: Uuid,
    },

    /// Re-drive instances left running by a runner that went away.
    Recover {
        /// Minimum seconds since the last update (defaults to `engine.recover_after_secs`).
        #[arg(long)]
        older_than: Option<u64>,

        #[arg(long, default_value = "100")]
        limit: u32,
    },
}

/// Handle an instance subcommand.
pub async fn handle_instance_command(
    cmd: InstanceCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        InstanceCommand::List { status, limit } => {
            handle_list(status.as_deref(), limit, state, json).await
        }
        InstanceCommand::Show { id } => handle_show(id, state, json).await,
        InstanceCommand::Resume { id } => handle_resume(id, state, json).await,
        InstanceCommand::Cancel { id, reason } => handle_cancel(id, &reason, state, json).await,
        InstanceCommand::Verify { id } => handle_verify(id, state, json).await,
        InstanceCommand::Recover { older_than, limit } => {
            let older_than = older_than.unwrap_or(state.config.engine.recover_after_secs);
            handle_recover(older_than, limit, state, json).await
        }
    }
}

async fn handle_list(status: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let status = match status {
        Some(s) => Some(s.parse::<InstanceStatus>().map_err(anyhow::Error::msg)?),
        None => None,
    };
    let instances = state.engine.list_instances(status, limit).await?;

    if json {
        return print_json(&instances);
    }

    if instances.is_empty() {
        println!();
        println!("  No instances.");
        println!(
            "  Start one with: {}",
            style("strand workflow start <workflow-id>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Waiting for"),
            Cell::new("Updated"),
        ]);
    for instance in &instances {
        table.add_row(vec![
            Cell::new(instance.id),
            Cell::new(&instance.workflow_id),
            Cell::new(styled_status(instance.status.as_str())),
            Cell::new(instance.waiting_for_event.as_deref().unwrap_or("-")),
            Cell::new(instance.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let instance = state
        .engine
        .get_instance(id)
        .await?
        .with_context(|| format!("Instance {id} not found"))?;
    let history = state.engine.history(id).await?;

    if json {
        return print_json(&serde_json::json!({"instance": instance, "history": history}));
    }

    println!();
    println!(
        "  {} {} v{}",
        style(&instance.workflow_id).cyan().bold(),
        style(instance.id).dim(),
        instance.version
    );
    println!("  Status: {}", styled_status(instance.status.as_str()));
    if let Some(event) = &instance.waiting_for_event {
        println!("  Waiting for: {}", style(event).cyan());
    }
    if let Some(result) = &instance.result {
        println!("  Result: {result}");
    }
    if let Some(error) = &instance.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(reason) = &instance.cancel_reason {
        println!("  Cancel reason: {reason}");
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Event"),
            Cell::new("Op"),
            Cell::new("Name"),
            Cell::new("Recorded"),
        ]);
    for event in &history {
        table.add_row(vec![
            Cell::new(event.sequence),
            Cell::new(event.event_type().as_str()),
            Cell::new(event.payload.op().map(|op| op.to_string()).unwrap_or_default()),
            Cell::new(event.payload.op_name().unwrap_or("")),
            Cell::new(event.recorded_at.format("%H:%M:%S%.3f")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_resume(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let outcome = match state.engine.resume(id).await {
        Ok(outcome) => outcome,
        Err(EngineError::WorkflowFailed { message, .. }) => WorkflowOutcome::Failed { error: message },
        Err(e) => return Err(e.into()),
    };

    if json {
        return print_json(&serde_json::json!({"instanceId": id, "outcome": outcome}));
    }
    println!();
    println!("  {} Resumed {}", style("*").green().bold(), style(id).dim());
    print_outcome(&outcome);
    println!();
    Ok(())
}

async fn handle_recover(older_than: u64, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let recovered = state
        .engine
        .recover_stale(std::time::Duration::from_secs(older_than), limit)
        .await?;

    if json {
        return print_json(&serde_json::json!({"recovered": recovered}));
    }
    println!();
    if recovered.is_empty() {
        println!("  No stranded instances.");
    } else {
        println!(
            "  {} Recovered {} instance(s)",
            style("*").green().bold(),
            recovered.len()
        );
        for id in &recovered {
            println!("    {}", style(id).dim());
        }
    }
    println!();
    Ok(())
}

async fn handle_cancel(id: Uuid, reason: &str, state: &AppState, json: bool) -> Result<()> {
    let outcome = state.engine.cancel(id, reason).await?;

    if json {
        return print_json(&serde_json::json!({"instanceId": id, "cancel": outcome}));
    }
    println!();
    match outcome {
        CancelOutcome::Cancelled => {
            println!("  {} Cancelled {}", style("*").yellow().bold(), style(id).dim());
        }
        CancelOutcome::Requested => {
            println!(
                "  {} Cancellation requested for {} (running; stops at its next operation)",
                style("*").yellow().bold(),
                style(id).dim()
            );
        }
    }
    println!();
    Ok(())
}

async fn handle_verify(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let report = state.engine.verify_replay(id).await?;

    if json {
        return print_json(&report);
    }
    println!();
    if report.matches {
        println!(
            "  {} Replay of {} reproduces its recorded {} outcome",
            style("*").green().bold(),
            style(id).dim(),
            report.recorded_status.as_str()
        );
        println!();
        Ok(())
    } else {
        println!("  Recorded: {}", report.recorded_status.as_str());
        println!("  Replayed: {}", serde_json::to_string(&report.reproduced)?);
        println!();
        bail!("replay of {id} diverged from its recorded outcome")
    }
}
