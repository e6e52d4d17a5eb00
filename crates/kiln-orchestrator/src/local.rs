//! In-process execution of `local` jobs.
//!
//! The trainer reports progress through a synchronous [`ProgressSink`]; events
//! are queued on a channel and written into the store by a companion task, so
//! every step write lands before the terminal write.

use crate::artifacts::ArtifactManager;
use crate::job::Job;
use crate::notify::{JobEvent, NotificationSink};
use crate::store::JobStore;
use kiln_training::{
    JobId, JobState, ProgressEvent, ProgressSink, Trainer, TrainingControl, TrainingError,
    TrainingHandle, TrainingOutcome, TrainingRequest, TrainingResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink for ChannelProgress {
    fn on_event(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Control handles of local runs that have not finished yet.
pub(crate) type LocalRuns = Arc<Mutex<HashMap<JobId, TrainingHandle>>>;

pub(crate) struct LocalRun {
    pub(crate) request: TrainingRequest,
    pub(crate) trainer: Arc<dyn Trainer>,
    pub(crate) control: TrainingControl,
    pub(crate) store: Arc<JobStore>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) artifacts: ArtifactManager,
    pub(crate) runs: LocalRuns,
}

impl LocalRun {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let job_id = self.request.job_id.clone();
        info!(job_id = %job_id, trainer = self.trainer.id(), "Local training started");

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_progress(
            rx,
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
        ));

        let result = {
            let progress = ChannelProgress { tx };
            self.train(&progress).await
        };
        if writer.await.is_err() {
            error!(job_id = %job_id, "Progress writer panicked");
        }

        self.runs.lock().await.remove(&job_id);
        self.finish(result).await;
    }

    async fn train(&self, progress: &ChannelProgress) -> TrainingResult<TrainingOutcome> {
        // Cancelled between the `running` write and the spawn.
        if self.control.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }
        self.trainer.prepare(&self.request).await?;
        self.trainer.run(&self.request, &self.control, progress).await
    }

    async fn finish(&self, result: TrainingResult<TrainingOutcome>) {
        let job_id = &self.request.job_id;
        match result {
            Ok(outcome) => self.complete(outcome).await,
            Err(TrainingError::Cancelled) => {
                debug!(job_id = %job_id, "Local training cancelled");
            }
            Err(e) => self.fail(format!("local training failed: {e}")).await,
        }
    }

    async fn complete(&self, outcome: TrainingOutcome) {
        let job_id = &self.request.job_id;

        let artifact = match &outcome.artifact_path {
            Some(path) => {
                let Ok(job) = self.store.get(job_id).await else {
                    return;
                };
                match self.artifacts.record_local(&job, path.clone()).await {
                    Ok(info) => Some(info),
                    Err(e) => {
                        self.fail(format!("could not record training output: {e}")).await;
                        return;
                    }
                }
            }
            None => None,
        };

        let completed = self
            .store
            .update(job_id, |job: &mut Job| {
                match job.state {
                    JobState::Running => {}
                    // Paused after the last checkpoint; nothing is left to resume.
                    JobState::Paused => job.transition(JobState::Running)?,
                    _ => return Ok(None),
                }
                job.replace_metrics(outcome.metrics.clone());
                job.artifact_info.clone_from(&artifact);
                job.transition(JobState::Completed)?;
                Ok(Some(job.current_metrics.clone()))
            })
            .await;

        match completed {
            Ok(Some(metrics)) => {
                info!(job_id = %job_id, "Local training completed");
                self.sink.notify(job_id, JobEvent::Completed { metrics });
                if let Some(info) = artifact {
                    self.sink.notify(
                        job_id,
                        JobEvent::ArtifactReady {
                            artifact_id: info.artifact_id,
                            path: info.path,
                            size_bytes: info.size_bytes,
                            hash_sha256: info.hash_sha256,
                        },
                    );
                }
            }
            Ok(None) => debug!(job_id = %job_id, "Job was stopped before training finished"),
            Err(e) => error!(job_id = %job_id, error = %e, "Could not record completion"),
        }
    }

    async fn fail(&self, reason: String) {
        let job_id = &self.request.job_id;
        let failed = self
            .store
            .update(job_id, |job| {
                if !matches!(job.state, JobState::Running | JobState::Paused) {
                    return Ok(false);
                }
                job.fail(reason.clone())?;
                Ok(true)
            })
            .await;

        match failed {
            Ok(true) => {
                error!(job_id = %job_id, reason = %reason, "Local training failed");
                self.sink.notify(job_id, JobEvent::Failed { reason });
            }
            Ok(false) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "Could not record failure"),
        }
    }
}

async fn write_progress(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    store: Arc<JobStore>,
    sink: Arc<dyn NotificationSink>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Step { job_id, metrics, .. } => {
                write_metrics(&store, sink.as_ref(), &job_id, metrics).await;
            }
            ProgressEvent::Message { job_id, message } => {
                sink.notify(&job_id, JobEvent::Log { line: message });
            }
            ProgressEvent::Started { job_id } | ProgressEvent::Finished { job_id } => {
                debug!(job_id = %job_id, "Trainer lifecycle event");
            }
        }
    }
}

async fn write_metrics(
    store: &JobStore,
    sink: &dyn NotificationSink,
    job_id: &JobId,
    metrics: kiln_training::Metrics,
) {
    let snapshot = metrics.clone();
    let written = store
        .update(job_id, |job| {
            if !matches!(job.state, JobState::Running | JobState::Paused) {
                return Ok(false);
            }
            job.replace_metrics(metrics);
            Ok(true)
        })
        .await;
    if matches!(written, Ok(true)) {
        sink.notify(job_id, JobEvent::Metrics { metrics: snapshot });
    }
}
