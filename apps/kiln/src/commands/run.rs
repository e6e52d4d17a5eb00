//! `kiln run`: create a job, train it in-process, and follow it to the end.

use crate::app::App;
use crate::commands::types::RunArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_connectors::LOCAL_PROVIDER;
use kiln_orchestrator::{BroadcastSink, Job, JobEvent, JobNotification};
use kiln_training::{JobConfig, JobId, JobState, TrainingHyperParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const STATUS_CHECK: Duration = Duration::from_millis(250);

pub async fn execute(app: &App, args: RunArgs) -> Result<()> {
    let sink = Arc::new(BroadcastSink::default());
    let mut events = sink.subscribe();
    let orchestrator = app.orchestrator(Arc::clone(&sink) as _, args.step_delay_ms)?;
    // Jobs left mid-flight by an earlier process are failed or re-monitored.
    orchestrator.recover().await.context("Failed to reconcile persisted jobs")?;

    let job = orchestrator.create_job(job_config(&args)).await.context("Invalid job config")?;
    let job_id = job.job_id.clone();
    if !args.json {
        println!();
        println!("{} {}", "Job".bold(), job_id.to_string().cyan());
    }

    orchestrator.submit(&job_id, LOCAL_PROVIDER).await?;

    let mut check = tokio::time::interval(STATUS_CHECK);
    let finished = loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(notification) => {
                    if !args.json {
                        print_event(&job_id, &notification);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped progress events");
                }
                Err(RecvError::Closed) => {}
            },
            _ = check.tick() => {
                let job = orchestrator.get_status(&job_id).await?;
                if job.state.is_terminal() {
                    break job;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !args.json {
                    println!("{}", "Interrupted; stopping job".yellow());
                }
                break orchestrator.cancel(&job_id).await?;
            }
        }
    };

    if !args.json {
        drain(&job_id, &mut events);
    }
    orchestrator.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else {
        print_summary(&finished);
    }

    if finished.state == JobState::Completed {
        Ok(())
    } else {
        anyhow::bail!("job {} ended {}", finished.job_id, finished.state)
    }
}

fn job_config(args: &RunArgs) -> JobConfig {
    let defaults = TrainingHyperParams::default();
    let hyperparams = TrainingHyperParams {
        seed: args.seed.unwrap_or(defaults.seed),
        epochs: args.epochs.unwrap_or(defaults.epochs),
        max_steps: args.max_steps.or(defaults.max_steps),
        learning_rate: args.learning_rate.unwrap_or(defaults.learning_rate),
        ..defaults
    };

    let config = JobConfig::new(args.model.clone(), args.dataset.clone()).with_hyperparams(hyperparams);
    match &args.output_dir {
        Some(dir) => config.with_output_dir(dir.clone()),
        None => config,
    }
}

fn drain(job_id: &JobId, events: &mut broadcast::Receiver<JobNotification>) {
    while let Ok(notification) = events.try_recv() {
        print_event(job_id, &notification);
    }
}

fn print_event(job_id: &JobId, notification: &JobNotification) {
    if &notification.job_id != job_id {
        return;
    }
    match &notification.event {
        JobEvent::Submitted { provider, .. } => {
            println!("  {} on {}", "submitted".dimmed(), provider.cyan());
        }
        JobEvent::Log { line } => println!("  {}", line.dimmed()),
        JobEvent::Metrics { metrics } => {
            let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("  {}", rendered.join(" "));
        }
        JobEvent::Paused => println!("  {}", "paused".yellow()),
        JobEvent::Resumed => println!("  {}", "resumed".yellow()),
        JobEvent::Completed { .. } => println!("  {}", "completed".green()),
        JobEvent::Failed { reason } => println!("  {} {}", "failed:".red(), reason),
        JobEvent::Stopped => println!("  {}", "stopped".yellow()),
        JobEvent::ArtifactReady { path, .. } => {
            println!("  {} {}", "artifact".dimmed(), path.display());
        }
    }
}

fn print_summary(job: &Job) {
    println!();
    let state = match job.state {
        JobState::Completed => job.state.to_string().bold().green(),
        JobState::Failed => job.state.to_string().bold().red(),
        _ => job.state.to_string().bold().yellow(),
    };
    println!("{} {}", "Finished:".bold(), state);
    if let Some(error) = &job.error {
        println!("  Error:    {}", error.red());
    }
    if let Some(artifact) = &job.artifact_info {
        println!("  Artifact: {}", artifact.path.display());
        println!("  SHA-256:  {}", artifact.hash_sha256.dimmed());
    }
    println!();
}
