use crate::error::ConnectorResult;
use async_trait::async_trait;
use kiln_training::{JobConfig, JobId, Metrics};
use serde::{Deserialize, Serialize};

/// Job state as reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Accepted but waiting for hardware.
    Queued,
    Running,
    Completed,
    Failed,
    /// Cancelled on the provider side.
    Cancelled,
}

impl ProviderState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One `poll_status` answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub state: ProviderState,
    #[serde(default)]
    pub metrics: Metrics,
    /// Provider-supplied detail, typically the failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProviderStatus {
    #[must_use]
    pub fn new(state: ProviderState) -> Self {
        Self { state, metrics: Metrics::new(), message: None }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A compute provider that can run training jobs.
///
/// Every method is a potential network call; callers must not hold locks across them.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry name (e.g. `"runpod"`, `"local"`).
    fn name(&self) -> &str;

    /// Cheap reachability/credential check used when listing providers.
    async fn health_check(&self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Hand a job to the provider. Returns the provider's job identifier.
    async fn submit(&self, job_id: &JobId, config: &JobConfig) -> ConnectorResult<String>;

    async fn poll_status(&self, provider_job_id: &str) -> ConnectorResult<ProviderStatus>;

    /// Log lines produced since the previous call for this job.
    async fn stream_logs(&self, provider_job_id: &str) -> ConnectorResult<Vec<String>>;

    /// Request cancellation. `Ok(false)` means the provider had nothing to cancel.
    async fn cancel(&self, provider_job_id: &str) -> ConnectorResult<bool>;

    /// Download the trained artifact bytes.
    async fn fetch_artifact(&self, provider_job_id: &str) -> ConnectorResult<Vec<u8>>;
}
