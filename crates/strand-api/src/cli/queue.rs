//! CLI queue subcommands.
//!
//! Queue definitions live in process memory, so `run` registers the queue
//! from a JSON file and dispatches it in one go.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use strand_types::job::DispatchOptions;
use strand_types::queue::{QueueConfig, QueueJob};
use uuid::Uuid;

use crate::cli::{parse_json_arg, print_json, styled_status};
use crate::state::AppState;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Queue subcommands.
#[derive(Subcommand)]
pub enum QueueCommand {
    /// Register a queue from a JSON file and dispatch it.
    Run {
        /// Path to the queue definition (`{id, steps, onFailure?}`).
        file: PathBuf,

        /// JSON input of the first step.
        #[arg(long)]
        input: Option<String>,

        /// Wait for every step to finish.
        #[arg(long)]
        wait: bool,
    },

    /// Show a queue run.
    Show {
        /// Queue job id.
        id: Uuid,
    },
}

/// Handle a queue subcommand.
pub async fn handle_queue_command(cmd: QueueCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        QueueCommand::Run { file, input, wait } => {
            handle_run(&file, input.as_deref(), wait, state, json).await
        }
        QueueCommand::Show { id } => {
            let queue_job = state
                .jobs
                .get_queue_job(id)
                .await?
                .with_context(|| format!("Queue job {id} not found"))?;
            print_queue_job(&queue_job, json)
        }
    }
}

pub(crate) async fn load_queue_file(path: &Path) -> Result<QueueConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid queue definition in {}", path.display()))
}

async fn handle_run(
    file: &Path,
    input: Option<&str>,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let config = load_queue_file(file).await?;
    let queue_id = config.id.clone();
    state.jobs.register_queue(config)?;

    let input = parse_json_arg(input, "input")?;
    let receipt = state
        .jobs
        .dispatch_queue(&queue_id, input, DispatchOptions::default())
        .await?;

    if !wait {
        if json {
            return print_json(&receipt);
        }
        println!();
        println!(
            "  {} Dispatched queue '{}'",
            style("*").green().bold(),
            style(&queue_id).cyan()
        );
        println!("  Queue job: {}", receipt.queue_job_id);
        println!("  First job: {}", receipt.job_id);
        println!();
        return Ok(());
    }

    let queue_job = loop {
        let queue_job = state
            .jobs
            .get_queue_job(receipt.queue_job_id)
            .await?
            .with_context(|| format!("Queue job {} not found", receipt.queue_job_id))?;
        if queue_job.status.is_terminal() {
            break queue_job;
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    };
    print_queue_job(&queue_job, json)
}

fn print_queue_job(queue_job: &QueueJob, json: bool) -> Result<()> {
    if json {
        return print_json(queue_job);
    }
    println!();
    println!(
        "  {} {}",
        style(&queue_job.queue_id).cyan().bold(),
        style(queue_job.id).dim()
    );
    println!("  Status: {}", styled_status(queue_job.status.as_str()));
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Worker"),
            Cell::new("Status"),
            Cell::new("Job"),
        ]);
    for (i, step) in queue_job.steps.iter().enumerate() {
        let status = serde_json::to_value(step.status)?;
        table.add_row(vec![
            Cell::new(i),
            Cell::new(&step.worker_id),
            Cell::new(styled_status(status.as_str().unwrap_or("?"))),
            Cell::new(step.job_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())),
        ]);
    }
    println!("{table}");
    Ok(())
}
