//! `kiln jobs`: read-only views of the job store.

use crate::app::App;
use crate::commands::types::JobsCommand;
use anyhow::Result;
use colored::{ColoredString, Colorize};
use kiln_orchestrator::{Job, JobFilter, OrchestratorError};
use kiln_training::{JobId, JobState};

pub async fn execute(app: &App, command: JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { provider, state, json } => list(app, provider, state, json).await,
        JobsCommand::Status { id, json } => status(app, &JobId::from(id.as_str()), json).await,
    }
}

async fn list(app: &App, provider: Option<String>, state: Option<JobState>, json: bool) -> Result<()> {
    let filter = JobFilter { provider, state };
    let jobs = app.open_store()?.list(&filter).await;

    if json {
        let summaries: Vec<_> = jobs.iter().map(Job::summary).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Jobs ({})", jobs.len()).bold().cyan());
    println!();

    if jobs.is_empty() {
        println!("  {}", "No jobs found.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<38} {:<12} {:<10} {:<20} {}", "ID", "State", "Provider", "Model", "Created");
    println!("{}", "─".repeat(100));
    for job in &jobs {
        println!(
            "{:<38} {:<12} {:<10} {:<20} {}",
            job.job_id.to_string().cyan(),
            colored_state(job.state),
            job.provider.as_deref().unwrap_or("-"),
            job.config.model,
            job.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

async fn status(app: &App, id: &JobId, json: bool) -> Result<()> {
    let job = match app.open_store()?.get(id).await {
        Ok(job) => job,
        Err(OrchestratorError::JobNotFound(_)) => anyhow::bail!("No job with id {id}"),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "Job".bold(), job.job_id.to_string().cyan());
    println!("  State:    {}", colored_state(job.state));
    println!("  Model:    {}", job.config.model);
    println!("  Dataset:  {}", job.config.dataset_path.display());
    println!("  Provider: {}", job.provider.as_deref().unwrap_or("-"));
    if let Some(provider_job_id) = &job.provider_job_id {
        println!("  Remote:   {provider_job_id}");
    }
    println!("  Created:  {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("  Started:  {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  Finished: {}", completed.to_rfc3339());
    }
    if let Some(error) = &job.error {
        println!("  Error:    {}", error.red());
    }
    if !job.current_metrics.is_empty() {
        println!("  Metrics:");
        for (name, value) in &job.current_metrics {
            println!("    {:<16} {}", name, value);
        }
    }
    if let Some(artifact) = &job.artifact_info {
        println!("  Artifact: {} ({} bytes)", artifact.path.display(), artifact.size_bytes);
        println!("  SHA-256:  {}", artifact.hash_sha256.dimmed());
    }
    println!();
    Ok(())
}

fn colored_state(state: JobState) -> ColoredString {
    let label = state.to_string();
    match state {
        JobState::Completed => label.green(),
        JobState::Failed => label.red(),
        JobState::Stopped | JobState::Paused => label.yellow(),
        JobState::Running | JobState::Initializing => label.blue(),
        JobState::Created => label.normal(),
    }
}
