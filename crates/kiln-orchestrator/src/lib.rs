//! Training job orchestrator for Kiln.
//!
//! The [`Orchestrator`] owns the job lifecycle: it creates jobs, submits them to
//! a provider through the [`ConnectorRegistry`], spawns a [`MonitorWorker`] per
//! running provider-backed job, drives `local` jobs in-process, cancels, and
//! downloads verified artifacts.
//!
//! # Example
//!
//! ```no_run
//! use kiln_connectors::{ConnectorRegistry, LocalConnector};
//! use kiln_orchestrator::Orchestrator;
//! use kiln_training::JobConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> kiln_orchestrator::Result<()> {
//! let registry = ConnectorRegistry::new().with(Arc::new(LocalConnector::new()));
//! let orchestrator = Orchestrator::builder(registry).build();
//!
//! let job = orchestrator.create_job(JobConfig::new("m1", "/data/train.jsonl")).await?;
//! orchestrator.submit(&job.job_id, "local").await?;
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod job;
pub mod local;
pub mod monitor;
pub mod notify;
pub mod store;

use kiln_connectors::{Connector, ConnectorError, ConnectorRegistry, LOCAL_PROVIDER};
use kiln_training::{
    ArtifactInfo, ArtifactLayout, DryRunTrainer, JobConfig, JobId, JobState, Trainer,
    TrainingControl, TrainingHandle, TrainingRequest,
};
use local::{LocalRun, LocalRuns};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

pub use artifacts::ArtifactManager;
pub use config::{ConfigError, KilnConfig, MonitorConfig, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use job::{Job, JobFilter, JobSummary};
pub use monitor::{MonitorExit, MonitorHandle, MonitorWorker};
pub use notify::{BroadcastSink, JobEvent, JobNotification, NotificationSink, NullSink, TracingSink};
pub use store::JobStore;

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: ConnectorRegistry,
    store: Option<Arc<JobStore>>,
    sink: Option<Arc<dyn NotificationSink>>,
    trainer: Option<Arc<dyn Trainer>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Job store to use. Defaults to an in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Notification sink. Defaults to [`TracingSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Trainer for `local` jobs. Defaults to [`DryRunTrainer`].
    #[must_use]
    pub fn trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Orchestrator {
        let permits = Arc::new(Semaphore::new(self.config.monitor.max_concurrent_monitors.max(1)));
        Orchestrator {
            store: self.store.unwrap_or_else(|| Arc::new(JobStore::in_memory())),
            registry: Arc::new(self.registry),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            trainer: self.trainer.unwrap_or_else(|| Arc::new(DryRunTrainer::default())),
            artifacts: ArtifactManager::new(ArtifactLayout::new(self.config.artifact_root.clone())),
            config: self.config,
            monitor_permits: permits,
            monitors: Mutex::new(HashMap::new()),
            local_runs: LocalRuns::default(),
            download_lock: Mutex::new(()),
        }
    }
}

/// Coordinates job creation, submission, monitoring, cancellation, and artifacts.
///
/// All operations take `&self` and are safe to call concurrently; share the
/// orchestrator behind an `Arc`.
pub struct Orchestrator {
    store: Arc<JobStore>,
    registry: Arc<ConnectorRegistry>,
    sink: Arc<dyn NotificationSink>,
    trainer: Arc<dyn Trainer>,
    artifacts: ArtifactManager,
    config: OrchestratorConfig,
    /// Bounds the number of monitors polling at once.
    monitor_permits: Arc<Semaphore>,
    monitors: Mutex<HashMap<JobId, MonitorHandle>>,
    /// Entries are removed by the run itself when training returns.
    local_runs: LocalRuns,
    /// Orders artifact writes with their store updates.
    download_lock: Mutex<()>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("trainer", &self.trainer.id())
            .field("artifact_root", &self.artifacts.layout().root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn builder(registry: ConnectorRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            store: None,
            sink: None,
            trainer: None,
            config: OrchestratorConfig::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Stores a new job in `created`.
    pub async fn create_job(&self, config: JobConfig) -> Result<Job> {
        config.validate().map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

        let job = Job::new(config);
        self.store.insert(job.clone()).await?;
        info!(job_id = %job.job_id, model = %job.config.model, "Job created");
        Ok(job)
    }

    /// Hands a `created` job to `provider`.
    ///
    /// On success the job is `running` and, for remote providers, a monitor is
    /// watching it. If the connector rejects the job it ends up `failed` with
    /// the reason recorded, and the connector error is returned.
    pub async fn submit(&self, job_id: &JobId, provider: &str) -> Result<Job> {
        let snapshot = self.store.get(job_id).await?;
        if snapshot.state != JobState::Created {
            return Err(OrchestratorError::transition(
                job_id,
                snapshot.state,
                JobState::Initializing,
                "only created jobs can be submitted",
            ));
        }
        let connector = self.registry.resolve(provider).map_err(|e| match e {
            ConnectorError::UnknownProvider(name) => OrchestratorError::UnknownProvider(name),
            source => OrchestratorError::Connector { provider: provider.to_string(), source },
        })?;

        // Claim the job; a concurrent submit loses here.
        let claimed = self
            .store
            .update(job_id, |job| {
                if job.state != JobState::Created {
                    return Err(OrchestratorError::transition(
                        job_id,
                        job.state,
                        JobState::Initializing,
                        "only created jobs can be submitted",
                    ));
                }
                job.transition(JobState::Initializing)?;
                Ok(job.clone())
            })
            .await?;
        debug!(job_id = %job_id, provider = %provider, "Submitting job");

        match connector.submit(job_id, &claimed.config).await {
            Ok(provider_job_id) => self.accept(job_id, provider, connector, provider_job_id).await,
            Err(source) => {
                let reason = format!("submission to '{provider}' failed: {source}");
                self.store.update(job_id, |job| job.fail(reason.clone())).await?;
                warn!(job_id = %job_id, provider = %provider, error = %source, "Submission failed");
                self.sink.notify(job_id, JobEvent::Failed { reason });
                Err(OrchestratorError::Submission { provider: provider.to_string(), source })
            }
        }
    }

    async fn accept(
        &self,
        job_id: &JobId,
        provider: &str,
        connector: Arc<dyn Connector>,
        provider_job_id: String,
    ) -> Result<Job> {
        // The handle map stays locked until the handle is registered, so a
        // `cancel` that observes `running` always finds it.
        if provider == LOCAL_PROVIDER {
            let mut runs = self.local_runs.lock().await;
            let job = self.mark_running(job_id, provider, None).await?;
            self.start_local(&mut runs, &job);
            Ok(job)
        } else {
            let mut monitors = self.monitors.lock().await;
            let job = self.mark_running(job_id, provider, Some(provider_job_id.clone())).await?;
            self.start_monitor(&mut monitors, job_id, connector, provider_job_id);
            Ok(job)
        }
    }

    async fn mark_running(
        &self,
        job_id: &JobId,
        provider: &str,
        provider_job_id: Option<String>,
    ) -> Result<Job> {
        let job = self
            .store
            .update(job_id, |job| {
                job.provider = Some(provider.to_string());
                job.provider_job_id.clone_from(&provider_job_id);
                job.transition(JobState::Running)?;
                Ok(job.clone())
            })
            .await?;

        info!(
            job_id = %job_id,
            provider = %provider,
            provider_job_id = ?job.provider_job_id,
            "Job running"
        );
        self.sink.notify(
            job_id,
            JobEvent::Submitted {
                provider: provider.to_string(),
                provider_job_id: job.provider_job_id.clone(),
            },
        );
        Ok(job)
    }

    /// Spawns a monitor unless a live one already exists for this job.
    fn start_monitor(
        &self,
        monitors: &mut HashMap<JobId, MonitorHandle>,
        job_id: &JobId,
        connector: Arc<dyn Connector>,
        provider_job_id: String,
    ) -> bool {
        monitors.retain(|_, handle| !handle.is_finished());
        if monitors.contains_key(job_id) {
            warn!(job_id = %job_id, "Monitor already running; not spawning another");
            return false;
        }

        let worker = MonitorWorker::new(
            job_id.clone(),
            provider_job_id,
            connector,
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            self.config.monitor.clone(),
        );
        monitors.insert(job_id.clone(), worker.spawn(Arc::clone(&self.monitor_permits)));
        true
    }

    fn start_local(&self, runs: &mut HashMap<JobId, TrainingHandle>, job: &Job) {
        let output_dir = job
            .config
            .output_dir
            .clone()
            .unwrap_or_else(|| self.artifacts.layout().local_output_dir(&job.job_id));
        let (handle, control) = TrainingControl::pair();

        runs.insert(job.job_id.clone(), handle);
        LocalRun {
            request: TrainingRequest { job_id: job.job_id.clone(), config: job.config.clone(), output_dir },
            trainer: Arc::clone(&self.trainer),
            control,
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            artifacts: self.artifacts.clone(),
            runs: Arc::clone(&self.local_runs),
        }
        .spawn();
    }

    /// Current record for `job_id`.
    pub async fn get_status(&self, job_id: &JobId) -> Result<Job> {
        self.store.get(job_id).await
    }

    /// Jobs matching `filter`, oldest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.store.list(filter).await
    }

    /// Stops a `running` or `paused` job.
    ///
    /// Cancelling a job that is already terminal returns it unchanged.
    /// Provider cancel errors are logged and do not block the local transition.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Job> {
        let job = self.store.get(job_id).await?;
        if job.state.is_terminal() {
            debug!(job_id = %job_id, state = %job.state, "Cancel on terminal job is a no-op");
            return Ok(job);
        }
        if !matches!(job.state, JobState::Running | JobState::Paused) {
            return Err(OrchestratorError::transition(
                job_id,
                job.state,
                JobState::Stopped,
                "only running or paused jobs can be cancelled",
            ));
        }

        if job.is_local() {
            if let Some(handle) = self.local_runs.lock().await.remove(job_id) {
                handle.cancel();
            }
        } else {
            // Signal the monitor before writing, so it stops polling first.
            if let Some(monitor) = self.monitors.lock().await.remove(job_id) {
                monitor.cancel();
            }
            self.cancel_remote(&job).await;
        }

        let (job, changed) = self
            .store
            .update(job_id, |job| {
                if job.state.is_terminal() {
                    return Ok((job.clone(), false));
                }
                job.transition(JobState::Stopped)?;
                Ok((job.clone(), true))
            })
            .await?;

        if changed {
            info!(job_id = %job_id, "Job stopped");
            self.sink.notify(job_id, JobEvent::Stopped);
        }
        Ok(job)
    }

    async fn cancel_remote(&self, job: &Job) {
        let (Some(provider), Some(provider_job_id)) = (&job.provider, &job.provider_job_id) else {
            return;
        };
        let Some(connector) = self.registry.get(provider) else {
            warn!(job_id = %job.job_id, provider = %provider, "Provider no longer registered");
            return;
        };
        match connector.cancel(provider_job_id).await {
            Ok(true) => debug!(job_id = %job.job_id, "Provider acknowledged cancel"),
            Ok(false) => debug!(job_id = %job.job_id, "Provider had nothing to cancel"),
            Err(e) => warn!(job_id = %job.job_id, error = %e, "Provider cancel failed"),
        }
    }

    /// Suspends a running local job between training steps.
    pub async fn pause(&self, job_id: &JobId) -> Result<Job> {
        self.set_paused(job_id, true).await
    }

    /// Resumes a paused local job.
    pub async fn resume(&self, job_id: &JobId) -> Result<Job> {
        self.set_paused(job_id, false).await
    }

    async fn set_paused(&self, job_id: &JobId, paused: bool) -> Result<Job> {
        let (from, to) = if paused {
            (JobState::Running, JobState::Paused)
        } else {
            (JobState::Paused, JobState::Running)
        };

        let job = self
            .store
            .update(job_id, |job| {
                if !job.is_local() {
                    return Err(OrchestratorError::transition(
                        job_id,
                        job.state,
                        to,
                        "pause/resume is only available for local jobs",
                    ));
                }
                if job.state != from {
                    return Err(OrchestratorError::transition(
                        job_id,
                        job.state,
                        to,
                        format!("job must be {from}"),
                    ));
                }
                job.transition(to)?;
                Ok(job.clone())
            })
            .await?;

        if let Some(handle) = self.local_runs.lock().await.get(job_id) {
            if paused {
                handle.pause();
            } else {
                handle.resume();
            }
        }

        info!(job_id = %job_id, state = %to, "Local job {}", if paused { "paused" } else { "resumed" });
        self.sink.notify(job_id, if paused { JobEvent::Paused } else { JobEvent::Resumed });
        Ok(job)
    }

    /// Downloads, stores, and verifies the trained artifact of a completed
    /// provider-backed job.
    ///
    /// Safe to retry: a failed write records nothing, and a repeat download
    /// replaces both the file and its hash.
    pub async fn download_artifact(&self, job_id: &JobId) -> Result<ArtifactInfo> {
        let job = self.store.get(job_id).await?;
        let not_available = |reason: &str| OrchestratorError::ArtifactNotAvailable {
            job_id: job_id.clone(),
            reason: reason.to_string(),
        };

        if job.state != JobState::Completed {
            return Err(not_available(&format!("job is {}, not completed", job.state)));
        }
        if job.is_local() {
            return Err(not_available("local jobs write their output directly; see artifact_info"));
        }
        let (Some(provider), Some(provider_job_id)) = (&job.provider, &job.provider_job_id) else {
            return Err(not_available("job was never submitted to a provider"));
        };
        let connector = self
            .registry
            .get(provider)
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.clone()))?;

        let bytes = connector.fetch_artifact(provider_job_id).await.map_err(|source| match source {
            ConnectorError::ArtifactUnavailable(reason) | ConnectorError::JobNotFound(reason) => {
                not_available(&reason)
            }
            source => OrchestratorError::Connector { provider: provider.clone(), source },
        })?;

        // The file on disk and `artifact_info` must come from the same write.
        let info = {
            let _guard = self.download_lock.lock().await;
            let info = self.artifacts.store_download(&job, bytes).await?;
            self.store
                .update(job_id, |job| {
                    job.artifact_info = Some(info.clone());
                    Ok(())
                })
                .await?;
            info
        };

        self.sink.notify(
            job_id,
            JobEvent::ArtifactReady {
                artifact_id: info.artifact_id.clone(),
                path: info.path.clone(),
                size_bytes: info.size_bytes,
                hash_sha256: info.hash_sha256.clone(),
            },
        );
        Ok(info)
    }

    /// Polls the store until the job is terminal.
    pub async fn wait_for_terminal(&self, job_id: &JobId, check_every: Duration) -> Result<Job> {
        loop {
            let job = self.store.get(job_id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(check_every).await;
        }
    }

    /// Number of monitors that have not exited yet.
    pub async fn active_monitors(&self) -> usize {
        let mut monitors = self.monitors.lock().await;
        monitors.retain(|_, handle| !handle.is_finished());
        monitors.len()
    }

    /// Number of local runs whose training has not returned yet.
    pub async fn active_local_runs(&self) -> usize {
        self.local_runs.lock().await.len()
    }

    /// Reconciles jobs loaded from a persisted store after a restart.
    ///
    /// Provider-backed `running` jobs get a fresh monitor. Jobs whose driver
    /// died with the previous process (`initializing`, local `running`/`paused`)
    /// are marked failed. Returns the number of monitors resumed.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        let candidates: Vec<Job> = self
            .store
            .list(&JobFilter::default())
            .await
            .into_iter()
            .filter(|job| matches!(job.state, JobState::Initializing | JobState::Running | JobState::Paused))
            .collect();

        for job in candidates {
            let orphaned = match (&job.state, job.is_local(), &job.provider, &job.provider_job_id) {
                (JobState::Initializing, ..) => Some("interrupted by restart during submission".to_string()),
                (_, true, ..) => Some("local training interrupted by restart".to_string()),
                (JobState::Running, false, Some(provider), Some(provider_job_id)) => {
                    match self.registry.get(provider) {
                        Some(connector) => {
                            let mut monitors = self.monitors.lock().await;
                            if self.start_monitor(&mut monitors, &job.job_id, connector, provider_job_id.clone()) {
                                resumed += 1;
                            }
                            None
                        }
                        None => Some(format!("provider '{provider}' is no longer registered")),
                    }
                }
                _ => Some(format!("inconsistent {} record found on restart", job.state)),
            };

            if let Some(reason) = orphaned {
                let failed = self
                    .store
                    .update(&job.job_id, |job| {
                        if job.state.is_terminal() {
                            return Ok(false);
                        }
                        job.fail(reason.clone())?;
                        Ok(true)
                    })
                    .await?;
                if failed {
                    warn!(job_id = %job.job_id, reason = %reason, "Marked orphaned job failed");
                    self.sink.notify(&job.job_id, JobEvent::Failed { reason });
                }
            }
        }

        info!(resumed, "Recovery finished");
        Ok(resumed)
    }

    /// Stops background work before the process exits.
    ///
    /// Monitors are detached without cancelling remote jobs, so a later
    /// [`recover`](Self::recover) can pick them up. Local training cannot
    /// outlive the process and is cancelled.
    pub async fn shutdown(&self) {
        for (job_id, monitor) in self.monitors.lock().await.drain() {
            debug!(job_id = %job_id, "Detaching monitor");
            monitor.detach();
        }

        let local: Vec<JobId> = self.local_runs.lock().await.keys().cloned().collect();
        for job_id in local {
            if let Err(e) = self.cancel(&job_id).await {
                warn!(job_id = %job_id, error = %e, "Could not stop local job on shutdown");
            }
        }
    }
}
