//! Relay CLI - Main entry point

mod commands;
mod output;
mod request;

use clap::{Parser, Subcommand};
use request::RequestArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Relay - run an agent with credential isolation, inline or offloaded
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file layered over the global and project configs
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent in this process and stream NDJSON events to stdout
    Run {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Offload the run to a remote worker
    Submit {
        #[command(flatten)]
        request: RequestArgs,

        /// Stream events until the task ends
        #[arg(long, conflicts_with = "callback_url")]
        wait: bool,

        /// POST the outcome here when the task ends
        #[arg(long)]
        callback_url: Option<String>,
    },
    /// Execute an offloaded task (started by the trigger)
    Worker {
        #[arg(long)]
        task_id: String,

        #[arg(long)]
        payload_path: String,
    },
    /// Print a task's stored metadata
    Status { task_id: String },
    /// Request cancellation of an offloaded task
    Cancel { task_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stdout carries events only
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            failure_code(&e)
        }
    }
}

async fn dispatch(args: Args) -> anyhow::Result<ExitCode> {
    let ctx = commands::Context::load(args.config)?;

    match args.command {
        Command::Run { request } => commands::run(&ctx, &request).await,
        Command::Submit {
            request,
            wait,
            callback_url,
        } => commands::submit(&ctx, &request, wait, callback_url).await,
        Command::Worker {
            task_id,
            payload_path,
        } => commands::worker(&ctx, &task_id, &payload_path).await,
        Command::Status { task_id } => commands::status(&ctx, &task_id).await,
        Command::Cancel { task_id } => commands::cancel(&ctx, &task_id).await,
    }
}

/// 2 for bad input or config, 1 otherwise
fn failure_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<relay_foundation::Error>() {
        Some(relay_foundation::Error::Validation(_) | relay_foundation::Error::Config(_)) => {
            ExitCode::from(2)
        }
        _ => ExitCode::from(1),
    }
}
