//! Strand CLI and REST API entry point.
//!
//! Binary name: `strand`
//!
//! Parses CLI arguments, initializes database and services, then dispatches
//! to the appropriate command handler or starts the REST API server together
//! with the timer sweeper and the job signal bridge.

mod background;
mod builtins;
mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use strand_observe::tracing_setup::{
    LogFormat, TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let options = TracingOptions {
        filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "strand", &mut std::io::stdout());
        return Ok(());
    }

    // Initialize application state (config, DB, services)
    let state = AppState::init().await?;

    let result = run(cli, state).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli, state: AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Workflow { command } => {
            cli::workflow::handle_workflow_command(command, &state, cli.json).await?;
        }
        Commands::Instance { command } => {
            cli::instance::handle_instance_command(command, &state, cli.json).await?;
        }
        Commands::Signal { command } => {
            cli::signal::handle_signal_command(command, &state, cli.json).await?;
        }
        Commands::Job { command } => {
            cli::job::handle_job_command(command, &state, cli.json).await?;
        }
        Commands::Queue { command } => {
            cli::queue::handle_queue_command(command, &state, cli.json).await?;
        }

        Commands::Sweep { limit } => {
            let limit = limit.unwrap_or(state.config.engine.timer_batch_size);
            let report = state
                .scheduler
                .process_due_timers(chrono::Utc::now(), limit)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "  {} fired {}, skipped {}, discarded {}",
                    console::style("*").green().bold(),
                    report.fired,
                    report.skipped,
                    report.discarded
                );
            }
        }

        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            let shutdown = CancellationToken::new();
            let sweeper = background::spawn_timer_sweeper(
                state.scheduler.clone(),
                &state.config.engine,
                shutdown.clone(),
            );
            let bridge = background::spawn_job_signal_bridge(
                state.jobs.clone(),
                state.scheduler.clone(),
                shutdown.clone(),
            );

            println!(
                "  {} Strand API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!(
                "  {}",
                console::style(format!("Data directory: {}", state.data_dir.display())).dim()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await;

            shutdown.cancel();
            for task in [sweeper, bridge] {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
            served?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {
            // Handled before state initialization.
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
