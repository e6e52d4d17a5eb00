//! Kiln CLI - command-line front end for the Kiln training orchestrator
//!
//! Runs in-process training jobs and inspects the persisted job store.

mod app;
mod commands;

use clap::{Parser, Subcommand};
use commands::types::{JobsCommand, RunArgs};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Kiln - multi-provider training job orchestrator
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about = "Kiln - training job orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults to the config file, then `warn`
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Read this config file instead of ~/.kiln/config.toml and ./.kilnrc
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of persisted job records (overrides [storage].state_dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job, train it in-process, and wait for it to finish
    Run(RunArgs),

    /// Inspect stored jobs
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// List registered providers and their availability
    Providers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let app = app::App::load(args.config.as_deref(), args.state_dir)?;

    let level = args
        .log_level
        .as_deref()
        .or(app.config().log_level.as_deref())
        .map_or(Level::WARN, parse_level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run(run) => commands::run::execute(&app, run).await,
        Command::Jobs(command) => commands::jobs::execute(&app, command).await,
        Command::Providers { json } => commands::providers::execute(json).await,
    }
}
