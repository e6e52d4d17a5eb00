//! Monitor workers: one background task per running provider-backed job.
//!
//! A worker talks to the rest of the system only through the [`JobStore`] and
//! the [`NotificationSink`]. It writes to its job only while the job is
//! `running`; as soon as it sees any other state it exits without writing.

use crate::config::MonitorConfig;
use crate::error::OrchestratorError;
use crate::job::Job;
use crate::notify::{JobEvent, NotificationSink};
use crate::store::JobStore;
use kiln_connectors::{Connector, ConnectorError, ProviderState, ProviderStatus};
use kiln_training::{JobId, JobState};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// The worker moved the job into this terminal state.
    Terminal(JobState),
    /// The cancellation signal was observed.
    Cancelled,
    /// Poll failures hit the cap; the job was marked failed.
    RetriesExhausted,
    /// The job left `running` through some other path; nothing was written.
    Detached(JobState),
}

/// Owner side of a spawned worker.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Signals the worker; it exits at its next iteration.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the task and leaves the remote job untouched (used on shutdown).
    pub fn detach(self) {
        self.task.abort();
    }

    pub async fn join(self) -> Option<MonitorExit> {
        self.task.await.ok()
    }
}

pub struct MonitorWorker {
    job_id: JobId,
    provider_job_id: String,
    connector: Arc<dyn Connector>,
    store: Arc<JobStore>,
    sink: Arc<dyn NotificationSink>,
    config: MonitorConfig,
    cancel: CancellationToken,
}

/// Result of writing one poll into the store.
enum Applied {
    Progress,
    /// Cancellation was signalled while the poll was in flight.
    Cancelled,
    Terminal(JobState, JobEvent),
    Detached(JobState),
}

impl MonitorWorker {
    #[must_use]
    pub fn new(
        job_id: JobId,
        provider_job_id: String,
        connector: Arc<dyn Connector>,
        store: Arc<JobStore>,
        sink: Arc<dyn NotificationSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            job_id,
            provider_job_id,
            connector,
            store,
            sink,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the worker. It waits for a slot in `permits` before its first poll.
    pub fn spawn(self, permits: Arc<Semaphore>) -> MonitorHandle {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(permits));
        MonitorHandle { cancel, task }
    }

    async fn run(self, permits: Arc<Semaphore>) -> MonitorExit {
        let _permit = tokio::select! {
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    error!(job_id = %self.job_id, "Monitor semaphore closed");
                    return MonitorExit::Detached(JobState::Running);
                }
            },
            () = self.cancel.cancelled() => {
                self.cancel_remote().await;
                return MonitorExit::Cancelled;
            }
        };

        info!(
            job_id = %self.job_id,
            provider = %self.connector.name(),
            provider_job_id = %self.provider_job_id,
            "Monitor started"
        );

        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.cancel_remote().await;
                info!(job_id = %self.job_id, "Monitor cancelled");
                return MonitorExit::Cancelled;
            }

            match self.connector.poll_status(&self.provider_job_id).await {
                Err(e) => {
                    failures += 1;
                    warn!(
                        job_id = %self.job_id,
                        error = %e,
                        failures,
                        max = self.config.max_consecutive_failures,
                        "Poll failed"
                    );
                    if failures >= self.config.max_consecutive_failures {
                        return self.give_up(failures, &e).await;
                    }
                    self.sleep(self.config.backoff(failures)).await;
                    continue;
                }
                Ok(status) => {
                    failures = 0;
                    self.forward_logs().await;
                    if let Some(exit) = self.apply(status).await {
                        return exit;
                    }
                }
            }

            self.sleep(self.config.poll_interval).await;
        }
    }

    /// Sleeps, waking early on cancellation.
    async fn sleep(&self, duration: std::time::Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.cancel.cancelled() => {}
        }
    }

    async fn cancel_remote(&self) {
        if let Err(e) = self.connector.cancel(&self.provider_job_id).await {
            warn!(job_id = %self.job_id, error = %e, "Provider cancel from monitor failed");
        }
    }

    async fn forward_logs(&self) {
        match self.connector.stream_logs(&self.provider_job_id).await {
            Ok(lines) => {
                for line in lines {
                    self.sink.notify(&self.job_id, JobEvent::Log { line });
                }
            }
            Err(e) => debug!(job_id = %self.job_id, error = %e, "Log fetch failed"),
        }
    }

    /// Writes one poll result. Returns `Some` when the worker should exit.
    async fn apply(&self, status: ProviderStatus) -> Option<MonitorExit> {
        let ProviderStatus { state, metrics, message } = status;
        let progress_metrics = metrics.clone();

        let applied = self
            .store
            .update(&self.job_id, |job: &mut Job| {
                // Checked under the store lock; `cancel` signals before it writes.
                if self.cancel.is_cancelled() {
                    return Ok(Applied::Cancelled);
                }
                if job.state != JobState::Running {
                    return Ok(Applied::Detached(job.state));
                }
                job.replace_metrics(metrics);
                match state {
                    ProviderState::Queued | ProviderState::Running => Ok(Applied::Progress),
                    ProviderState::Completed => {
                        job.transition(JobState::Completed)?;
                        Ok(Applied::Terminal(
                            JobState::Completed,
                            JobEvent::Completed { metrics: job.current_metrics.clone() },
                        ))
                    }
                    ProviderState::Failed => {
                        let reason = message.unwrap_or_else(|| "provider reported failure".to_string());
                        job.fail(reason.clone())?;
                        Ok(Applied::Terminal(JobState::Failed, JobEvent::Failed { reason }))
                    }
                    ProviderState::Cancelled => {
                        job.transition(JobState::Stopped)?;
                        job.error = Some(message.unwrap_or_else(|| "cancelled by provider".to_string()));
                        Ok(Applied::Terminal(JobState::Stopped, JobEvent::Stopped))
                    }
                }
            })
            .await;

        match applied {
            Ok(Applied::Progress) => {
                if !progress_metrics.is_empty() {
                    self.sink.notify(&self.job_id, JobEvent::Metrics { metrics: progress_metrics });
                }
                None
            }
            Ok(Applied::Cancelled) => {
                self.cancel_remote().await;
                info!(job_id = %self.job_id, "Monitor cancelled; discarding in-flight poll");
                Some(MonitorExit::Cancelled)
            }
            Ok(Applied::Terminal(state, event)) => {
                info!(job_id = %self.job_id, state = %state, "Job reached terminal state");
                self.sink.notify(&self.job_id, event);
                Some(MonitorExit::Terminal(state))
            }
            Ok(Applied::Detached(state)) => {
                debug!(job_id = %self.job_id, state = %state, "Job left running; monitor exiting");
                Some(MonitorExit::Detached(state))
            }
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Monitor could not update job");
                Some(MonitorExit::Detached(JobState::Running))
            }
        }
    }

    async fn give_up(&self, failures: u32, last: &ConnectorError) -> MonitorExit {
        let reason = OrchestratorError::Monitoring(format!(
            "gave up after {failures} consecutive poll failures; last error: {last}"
        ))
        .to_string();

        let failed = self
            .store
            .update(&self.job_id, |job| {
                if self.cancel.is_cancelled() || job.state != JobState::Running {
                    return Ok(false);
                }
                job.fail(reason.clone())?;
                Ok(true)
            })
            .await;

        match failed {
            Ok(true) => {
                error!(job_id = %self.job_id, reason = %reason, "Monitoring failed");
                self.sink.notify(&self.job_id, JobEvent::Failed { reason });
                MonitorExit::RetriesExhausted
            }
            Ok(false) if self.cancel.is_cancelled() => MonitorExit::Cancelled,
            Ok(false) => MonitorExit::Detached(JobState::Running),
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Monitor could not record failure");
                MonitorExit::RetriesExhausted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullSink;
    use kiln_connectors::{ConnectorResult, MockConnector};
    use kiln_training::{JobConfig, MetricValue, Metrics};
    use std::time::Duration;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_concurrent_monitors: 4,
        }
    }

    async fn running_job(store: &JobStore) -> JobId {
        let mut job = Job::new(JobConfig::new("m1", "/d"));
        job.provider = Some("runpod".to_string());
        job.provider_job_id = Some("rp_1".to_string());
        job.transition(JobState::Initializing).unwrap();
        job.transition(JobState::Running).unwrap();
        let id = job.job_id.clone();
        store.insert(job).await.unwrap();
        id
    }

    fn worker(id: &JobId, connector: Arc<MockConnector>, store: Arc<JobStore>) -> MonitorWorker {
        MonitorWorker::new(
            id.clone(),
            "rp_1".to_string(),
            connector,
            store,
            Arc::new(NullSink),
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_completes_and_replaces_metrics() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        let connector = Arc::new(MockConnector::new("runpod").with_poll_results([
            Ok(ProviderStatus::new(ProviderState::Running).with_metrics(Metrics::from([
                ("step".to_string(), MetricValue::from(1u64)),
                ("loss".to_string(), MetricValue::from(1.5)),
            ]))),
            Ok(ProviderStatus::new(ProviderState::Completed)
                .with_metrics(Metrics::from([("step".to_string(), MetricValue::from(2u64))]))),
        ]));

        let handle = worker(&id, Arc::clone(&connector), Arc::clone(&store))
            .spawn(Arc::new(Semaphore::new(1)));
        assert_eq!(handle.join().await, Some(MonitorExit::Terminal(JobState::Completed)));

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.completed_at.is_some());
        // Wholesale replacement: `loss` from the first poll is gone.
        assert!(!job.current_metrics.contains_key("loss"));
        assert_eq!(job.current_metrics["step"].as_f64(), Some(2.0));
    }

    #[tokio::test]
    async fn test_transient_errors_reset_on_success() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        let flaky =
            || -> ConnectorResult<ProviderStatus> { Err(ConnectorError::Request("timeout".to_string())) };
        let connector = Arc::new(MockConnector::new("runpod").with_poll_results([
            flaky(),
            flaky(),
            flaky(),
            flaky(),
            Ok(ProviderStatus::new(ProviderState::Running)),
            flaky(),
            flaky(),
            Ok(ProviderStatus::new(ProviderState::Completed)),
        ]));

        let handle = worker(&id, Arc::clone(&connector), Arc::clone(&store))
            .spawn(Arc::new(Semaphore::new(1)));
        assert_eq!(handle.join().await, Some(MonitorExit::Terminal(JobState::Completed)));
        assert_eq!(connector.calls().poll_status, 8);
    }

    #[tokio::test]
    async fn test_provider_failure_records_reason() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        let connector = Arc::new(MockConnector::new("runpod").with_poll_results([Ok(
            ProviderStatus::new(ProviderState::Failed).with_message("CUDA out of memory"),
        )]));

        let handle = worker(&id, connector, Arc::clone(&store)).spawn(Arc::new(Semaphore::new(1)));
        assert_eq!(handle.join().await, Some(MonitorExit::Terminal(JobState::Failed)));

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.error.as_deref(), Some("CUDA out of memory"));
        assert_eq!(job.current_metrics["error"].as_str(), Some("CUDA out of memory"));
    }

    #[tokio::test]
    async fn test_exits_without_writing_when_job_left_running() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        store.update(&id, |job| job.transition(JobState::Stopped)).await.unwrap();

        let connector = Arc::new(MockConnector::new("runpod").with_poll_results([Ok(
            ProviderStatus::new(ProviderState::Completed),
        )]));
        let handle = worker(&id, connector, Arc::clone(&store)).spawn(Arc::new(Semaphore::new(1)));
        assert_eq!(handle.join().await, Some(MonitorExit::Detached(JobState::Stopped)));
        assert_eq!(store.get(&id).await.unwrap().state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_permit() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        let connector = Arc::new(MockConnector::new("runpod"));
        let permits = Arc::new(Semaphore::new(0));

        let handle = worker(&id, Arc::clone(&connector), Arc::clone(&store)).spawn(permits);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.calls().poll_status, 0);

        handle.cancel();
        assert_eq!(handle.join().await, Some(MonitorExit::Cancelled));
        assert_eq!(connector.calls().cancel, 1);
        assert_eq!(connector.calls().poll_status, 0);
    }

    /// Reports `completed`, but only after a delay.
    struct SlowConnector;

    #[async_trait::async_trait]
    impl Connector for SlowConnector {
        fn name(&self) -> &str {
            "runpod"
        }

        async fn submit(&self, _job_id: &JobId, _config: &JobConfig) -> ConnectorResult<String> {
            Ok("rp_1".to_string())
        }

        async fn poll_status(&self, _provider_job_id: &str) -> ConnectorResult<ProviderStatus> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ProviderStatus::new(ProviderState::Completed))
        }

        async fn stream_logs(&self, _provider_job_id: &str) -> ConnectorResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn cancel(&self, _provider_job_id: &str) -> ConnectorResult<bool> {
            Ok(true)
        }

        async fn fetch_artifact(&self, _provider_job_id: &str) -> ConnectorResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_cancel_during_poll_discards_result() {
        let store = Arc::new(JobStore::in_memory());
        let id = running_job(&store).await;
        let handle = MonitorWorker::new(
            id.clone(),
            "rp_1".to_string(),
            Arc::new(SlowConnector),
            Arc::clone(&store),
            Arc::new(NullSink),
            fast_config(),
        )
        .spawn(Arc::new(Semaphore::new(1)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        assert_eq!(handle.join().await, Some(MonitorExit::Cancelled));

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.completed_at.is_none());
    }
}
