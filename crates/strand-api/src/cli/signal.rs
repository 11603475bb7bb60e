//! CLI signal subcommands.

use anyhow::Result;
use clap::Subcommand;
use console::style;
use strand_core::workflow::{SignalDelivery, SignalRequest};
use uuid::Uuid;

use crate::cli::workflow::print_outcome;
use crate::cli::{parse_json_arg, print_json};
use crate::state::AppState;

/// Signal subcommands.
#[derive(Subcommand)]
pub enum SignalCommand {
    /// Deliver a named event to one waiting instance.
    Send {
        /// Event name.
        event: String,

        /// JSON payload.
        #[arg(long)]
        payload: Option<String>,

        /// Correlation token of the waiting instance.
        #[arg(long)]
        token: Option<String>,

        /// Target instance (defaults to the oldest waiter on the event).
        #[arg(long)]
        instance: Option<Uuid>,
    },

    /// Resume the instance waiting under a token.
    Resume {
        token: String,

        /// JSON payload.
        #[arg(long)]
        payload: Option<String>,
    },
}

/// Handle a signal subcommand.
pub async fn handle_signal_command(cmd: SignalCommand, state: &AppState, json: bool) -> Result<()> {
    let delivery = match cmd {
        SignalCommand::Send {
            event,
            payload,
            token,
            instance,
        } => {
            let request = SignalRequest {
                event_name: event,
                payload: parse_json_arg(payload.as_deref(), "payload")?,
                token,
                instance_id: instance,
            };
            state.scheduler.send_signal(request).await?
        }
        SignalCommand::Resume { token, payload } => {
            let payload = parse_json_arg(payload.as_deref(), "payload")?;
            state.scheduler.resume_by_token(&token, payload).await?
        }
    };
    print_delivery(&delivery, json)
}

fn print_delivery(delivery: &SignalDelivery, json: bool) -> Result<()> {
    if json {
        return print_json(delivery);
    }
    println!();
    println!(
        "  {} Signal delivered to {}",
        style("*").green().bold(),
        style(delivery.instance_id).cyan()
    );
    match &delivery.outcome {
        Some(outcome) => print_outcome(outcome),
        None => println!("  Instance is busy; the signal is pending and will be consumed on its next run."),
    }
    println!();
    Ok(())
}
