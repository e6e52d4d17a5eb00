//! Argument types shared by the command modules.

use clap::{Args, Subcommand};
use kiln_training::JobState;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Base model identifier
    #[arg(short, long)]
    pub model: String,

    /// Training dataset (JSONL)
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Where the trainer writes its output (defaults to the job's artifact directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub epochs: Option<u32>,

    /// Stop after this many steps
    #[arg(long)]
    pub max_steps: Option<u64>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Delay per dry-run step (overrides [local].step_delay_ms)
    #[arg(long)]
    pub step_delay_ms: Option<u64>,

    /// Print the final job record as JSON instead of streaming events
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum JobsCommand {
    /// List stored jobs, oldest first
    List {
        /// Only jobs submitted to this provider
        #[arg(long)]
        provider: Option<String>,

        /// Only jobs in this state (created, running, completed, ...)
        #[arg(long)]
        state: Option<JobState>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one job in detail
    Status {
        /// Job ID
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
