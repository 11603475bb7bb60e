//! CLI job subcommands: dispatch, show, list, workers.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use strand_types::job::{DispatchMode, DispatchOptions, JobRecord};
use uuid::Uuid;

use crate::cli::{parse_json_arg, print_json, styled_status};
use crate::state::AppState;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a dispatched job runs.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Local,
    Remote,
    Auto,
}

impl From<ModeArg> for DispatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Local => DispatchMode::Local,
            ModeArg::Remote => DispatchMode::Remote,
            ModeArg::Auto => DispatchMode::Auto,
        }
    }
}

/// Job subcommands.
#[derive(Subcommand)]
pub enum JobCommand {
    /// Dispatch one worker invocation.
    Dispatch {
        /// Worker id.
        worker: String,

        /// JSON input.
        #[arg(long)]
        input: Option<String>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// URL notified when the job finishes.
        #[arg(long)]
        webhook_url: Option<String>,

        /// JSON object stored as job metadata.
        #[arg(long)]
        metadata: Option<String>,

        /// Wait for the job to finish (local jobs only run while this process lives).
        #[arg(long)]
        wait: bool,
    },

    /// Show a job's status record.
    Show {
        id: Uuid,
    },

    /// List jobs, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by worker id.
        #[arg(long)]
        worker: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List registered workers.
    Workers,
}

/// Handle a job subcommand.
pub async fn handle_job_command(cmd: JobCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        JobCommand::Dispatch {
            worker,
            input,
            mode,
            webhook_url,
            metadata,
            wait,
        } => {
            let options = DispatchOptions {
                mode: mode.map(DispatchMode::from),
                webhook_url,
                metadata: match metadata.as_deref() {
                    Some(raw) => Some(parse_json_arg(Some(raw), "metadata")?),
                    None => None,
                },
            };
            let input = parse_json_arg(input.as_deref(), "input")?;
            handle_dispatch(&worker, input, options, wait, state, json).await
        }
        JobCommand::Show { id } => handle_show(id, state, json).await,
        JobCommand::List { worker, limit } => handle_list(worker.as_deref(), limit, state, json).await,
        JobCommand::Workers => handle_workers(state, json),
    }
}

async fn handle_dispatch(
    worker: &str,
    input: serde_json::Value,
    options: DispatchOptions,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let receipt = state.jobs.dispatch(worker, input, options).await?;

    if !wait {
        if json {
            return print_json(&receipt);
        }
        println!();
        println!(
            "  {} Dispatched '{}'",
            style("*").green().bold(),
            style(worker).cyan()
        );
        println!("  Job ID: {}", receipt.job_id);
        println!(
            "  Check progress: {}",
            style(format!("strand job show {}", receipt.job_id)).dim()
        );
        println!();
        return Ok(());
    }

    let record = wait_for_job(state, receipt.job_id).await?;
    if json {
        return print_json(&record);
    }
    print_record(&record);
    Ok(())
}

pub(crate) async fn wait_for_job(state: &AppState, id: Uuid) -> Result<JobRecord> {
    loop {
        let record = state
            .jobs
            .get_job(id)
            .await?
            .with_context(|| format!("Job {id} not found"))?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn handle_show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let record = state
        .jobs
        .get_job(id)
        .await?
        .with_context(|| format!("Job {id} not found"))?;
    if json {
        return print_json(&record);
    }
    print_record(&record);
    Ok(())
}

fn print_record(record: &JobRecord) {
    println!();
    println!(
        "  {} {}",
        style(&record.worker_id).cyan().bold(),
        style(record.id).dim()
    );
    println!("  Status: {}", styled_status(record.status.as_str()));
    println!("  Progress: {}%", record.progress);
    if let Some(output) = &record.output {
        println!("  Output: {output}");
    }
    if let Some(error) = &record.error {
        match &error.name {
            Some(name) => println!("  Error: {} ({name})", style(&error.message).red()),
            None => println!("  Error: {}", style(&error.message).red()),
        }
    }
    if !record.logs.is_empty() {
        println!("  Logs:");
        for log in &record.logs {
            println!("    {} {}", style(log.at.format("%H:%M:%S%.3f")).dim(), log.message);
        }
    }
    println!();
}

async fn handle_list(worker: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let jobs = state.jobs.list_jobs(worker, limit).await?;
    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!();
        println!("  No jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Worker"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Created"),
        ]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.worker_id),
            Cell::new(styled_status(job.status.as_str())),
            Cell::new(format!("{}%", job.progress)),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn handle_workers(state: &AppState, json: bool) -> Result<()> {
    let mut workers = state.jobs.workers().list();
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    if json {
        return print_json(&workers);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Worker").fg(Color::Cyan), Cell::new("Description")]);
    for worker in &workers {
        table.add_row(vec![
            Cell::new(&worker.id),
            Cell::new(worker.description.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::job::JobStatus;

    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn wait_for_job_returns_terminal_record() {
        let (state, _tmp) = test_state().await;
        let receipt = state
            .jobs
            .dispatch("echo", json!({"x": 1}), DispatchOptions::default())
            .await
            .unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), wait_for_job(&state, receipt.job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn wait_for_unknown_job_fails() {
        let (state, _tmp) = test_state().await;
        assert!(wait_for_job(&state, Uuid::now_v7()).await.is_err());
    }

    #[test]
    fn mode_arg_maps_to_dispatch_mode() {
        assert_eq!(DispatchMode::from(ModeArg::Remote), DispatchMode::Remote);
        assert_eq!(DispatchMode::from(ModeArg::Auto), DispatchMode::Auto);
    }
}
