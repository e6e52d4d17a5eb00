use crate::error::{TrainingError, TrainingResult};
use crate::job::{JobConfig, JobId, MetricValue, Metrics};
use crate::progress::{ProgressEvent, ProgressSink};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Everything a trainer needs to run one job.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub job_id: JobId,
    pub config: JobConfig,
    /// Resolved output directory (the config's, or the job's artifact directory).
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingOutcome {
    pub metrics: Metrics,
    /// Primary output file, recorded as the job's artifact when present.
    pub artifact_path: Option<PathBuf>,
}

/// Controller side of a running in-process training loop.
#[derive(Debug, Clone)]
pub struct TrainingHandle {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl TrainingHandle {
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Trainer side: observed between steps via [`TrainingControl::checkpoint`].
#[derive(Debug, Clone)]
pub struct TrainingControl {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl TrainingControl {
    #[must_use]
    pub fn pair() -> (TrainingHandle, Self) {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        (TrainingHandle { cancel: cancel.clone(), paused: tx }, Self { cancel, paused: rx })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait here while paused; `Err(Cancelled)` once cancellation is requested.
    pub async fn checkpoint(&self) -> TrainingResult<()> {
        let mut paused = self.paused.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(TrainingError::Cancelled),
                changed = paused.changed() => {
                    // Handle dropped: nobody can resume us, so don't stay parked.
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> TrainingResult<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(TrainingError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// An in-process training backend.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn prepare(&self, request: &TrainingRequest) -> TrainingResult<()>;

    async fn run(
        &self,
        request: &TrainingRequest,
        control: &TrainingControl,
        progress: &dyn ProgressSink,
    ) -> TrainingResult<TrainingOutcome>;
}

/// Walks the configured schedule without touching a GPU.
///
/// Reports a decaying loss per step and writes `adapter_config.json` to the
/// output directory, so the rest of the pipeline can be exercised end to end.
#[derive(Debug, Clone)]
pub struct DryRunTrainer {
    step_delay: Duration,
    steps_per_epoch: u64,
}

impl DryRunTrainer {
    #[must_use]
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay, steps_per_epoch: 10 }
    }

    fn total_steps(&self, config: &JobConfig) -> u64 {
        config
            .hyperparams
            .max_steps
            .unwrap_or_else(|| u64::from(config.hyperparams.epochs) * self.steps_per_epoch)
    }
}

impl Default for DryRunTrainer {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[allow(clippy::cast_precision_loss)]
fn dry_run_loss(step: u64, total: u64) -> f64 {
    let progress = step as f64 / total.max(1) as f64;
    2.0f64.mul_add((-3.0 * progress).exp(), 0.1)
}

#[async_trait]
impl Trainer for DryRunTrainer {
    fn id(&self) -> &'static str {
        "dry-run"
    }

    async fn prepare(&self, request: &TrainingRequest) -> TrainingResult<()> {
        request.config.validate()?;
        if !request.config.dataset_path.exists() {
            return Err(TrainingError::Trainer(format!(
                "dataset not found: {}",
                request.config.dataset_path.display()
            )));
        }
        tokio::fs::create_dir_all(&request.output_dir).await?;
        Ok(())
    }

    async fn run(
        &self,
        request: &TrainingRequest,
        control: &TrainingControl,
        progress: &dyn ProgressSink,
    ) -> TrainingResult<TrainingOutcome> {
        let job_id = request.job_id.clone();
        let total = self.total_steps(&request.config);
        let epochs = u64::from(request.config.hyperparams.epochs);
        let steps_per_epoch = total.div_ceil(epochs).max(1);

        progress.on_event(ProgressEvent::Started { job_id: job_id.clone() });
        progress.on_event(ProgressEvent::Message {
            job_id: job_id.clone(),
            message: format!("dry run of {} for {total} steps", request.config.model),
        });

        let mut metrics = Metrics::new();
        for step in 1..=total {
            control.checkpoint().await?;
            control.sleep(self.step_delay).await?;

            metrics = Metrics::from([
                ("step".to_string(), MetricValue::from(step)),
                ("total_steps".to_string(), MetricValue::from(total)),
                ("epoch".to_string(), MetricValue::from((step - 1) / steps_per_epoch + 1)),
                ("loss".to_string(), MetricValue::from(dry_run_loss(step, total))),
                (
                    "learning_rate".to_string(),
                    MetricValue::from(request.config.hyperparams.learning_rate),
                ),
            ]);
            progress.on_event(ProgressEvent::Step {
                job_id: job_id.clone(),
                step,
                total: Some(total),
                metrics: metrics.clone(),
            });
        }

        let artifact_path = request.output_dir.join("adapter_config.json");
        let adapter = json!({
            "trainer": self.id(),
            "base_model": request.config.model,
            "lora_rank": request.config.hyperparams.lora_rank,
            "lora_alpha": request.config.hyperparams.lora_alpha,
            "seed": request.config.hyperparams.seed,
            "steps": total,
            "final_loss": metrics.get("loss").and_then(MetricValue::as_f64),
        });
        tokio::fs::write(&artifact_path, serde_json::to_vec_pretty(&adapter)?).await?;

        progress.on_event(ProgressEvent::Finished { job_id });
        Ok(TrainingOutcome { metrics, artifact_path: Some(artifact_path) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TrainingHyperParams;
    use crate::progress::RecordingProgressSink;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn request(temp: &TempDir, max_steps: u64) -> TrainingRequest {
        let dataset = temp.path().join("data.jsonl");
        std::fs::write(&dataset, "{}\n").unwrap();
        TrainingRequest {
            job_id: JobId::from("job-1"),
            config: JobConfig::new("m1", dataset).with_hyperparams(TrainingHyperParams {
                max_steps: Some(max_steps),
                ..Default::default()
            }),
            output_dir: temp.path().join("out"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_reports_every_step_and_writes_adapter() {
        let temp = TempDir::new().unwrap();
        let req = request(&temp, 3);
        let trainer = DryRunTrainer::new(Duration::from_millis(1));
        let (_handle, control) = TrainingControl::pair();
        let sink = RecordingProgressSink::default();

        trainer.prepare(&req).await.unwrap();
        let outcome = trainer.run(&req, &control, &sink).await.unwrap();

        let steps = sink
            .events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Step { .. }))
            .count();
        assert_eq!(steps, 3);
        assert_eq!(outcome.metrics["step"].as_f64(), Some(3.0));
        assert!(outcome.artifact_path.unwrap().is_file());
    }

    #[tokio::test]
    async fn test_prepare_rejects_missing_dataset() {
        let temp = TempDir::new().unwrap();
        let mut req = request(&temp, 1);
        req.config.dataset_path = temp.path().join("nope.jsonl");
        let result = DryRunTrainer::default().prepare(&req).await;
        assert!(matches!(result, Err(TrainingError::Trainer(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_loop() {
        let temp = TempDir::new().unwrap();
        let req = request(&temp, 10_000);
        let trainer = Arc::new(DryRunTrainer::new(Duration::from_millis(5)));
        let (handle, control) = TrainingControl::pair();
        trainer.prepare(&req).await.unwrap();

        let task = tokio::spawn({
            let trainer = Arc::clone(&trainer);
            async move { trainer.run(&req, &control, &RecordingProgressSink::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TrainingError::Cancelled)));
    }

    #[tokio::test]
    async fn test_checkpoint_blocks_while_paused() {
        let (handle, control) = TrainingControl::pair();
        handle.pause();

        let waiter = tokio::spawn(async move { control.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        handle.resume();
        assert!(waiter.await.unwrap().is_ok());
    }
}
