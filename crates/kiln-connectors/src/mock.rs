//! Scripted connector for tests and demos.

use crate::connector::{Connector, ProviderState, ProviderStatus};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use kiln_training::{JobConfig, JobId};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCallCounts {
    pub submit: usize,
    pub poll_status: usize,
    pub stream_logs: usize,
    pub cancel: usize,
    pub fetch_artifact: usize,
}

#[derive(Debug)]
struct MockState {
    health: ConnectorResult<()>,
    submit_results: VecDeque<ConnectorResult<String>>,
    poll_results: VecDeque<ConnectorResult<ProviderStatus>>,
    log_batches: VecDeque<Vec<String>>,
    cancel_result: ConnectorResult<bool>,
    artifact: ConnectorResult<Vec<u8>>,
    calls: MockCallCounts,
}

/// A connector whose answers are queued up front.
///
/// Queued submit/poll results are consumed in order. Once the poll queue is
/// empty the provider keeps reporting `running`; once the submit queue is empty
/// it hands out `<name>_<n>` identifiers.
#[derive(Debug)]
pub struct MockConnector {
    name: String,
    state: Mutex<MockState>,
}

impl MockConnector {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            state: Mutex::new(MockState {
                health: Ok(()),
                submit_results: VecDeque::new(),
                poll_results: VecDeque::new(),
                log_batches: VecDeque::new(),
                cancel_result: Ok(true),
                artifact: Err(ConnectorError::ArtifactUnavailable(format!(
                    "{name} has no artifact"
                ))),
                calls: MockCallCounts::default(),
            }),
            name,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_health(self, health: ConnectorResult<()>) -> Self {
        self.state().health = health;
        self
    }

    #[must_use]
    pub fn with_submit_result(self, result: ConnectorResult<String>) -> Self {
        self.state().submit_results.push_back(result);
        self
    }

    #[must_use]
    pub fn with_poll_results(
        self,
        results: impl IntoIterator<Item = ConnectorResult<ProviderStatus>>,
    ) -> Self {
        self.state().poll_results.extend(results);
        self
    }

    #[must_use]
    pub fn with_logs(self, lines: Vec<String>) -> Self {
        self.state().log_batches.push_back(lines);
        self
    }

    #[must_use]
    pub fn with_cancel_result(self, result: ConnectorResult<bool>) -> Self {
        self.state().cancel_result = result;
        self
    }

    #[must_use]
    pub fn with_artifact(self, bytes: Vec<u8>) -> Self {
        self.set_artifact(bytes);
        self
    }

    /// Replace the artifact served by `fetch_artifact`.
    pub fn set_artifact(&self, bytes: Vec<u8>) {
        self.state().artifact = Ok(bytes);
    }

    pub fn push_poll_result(&self, result: ConnectorResult<ProviderStatus>) {
        self.state().poll_results.push_back(result);
    }

    #[must_use]
    pub fn calls(&self) -> MockCallCounts {
        self.state().calls
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> ConnectorResult<()> {
        self.state().health.clone()
    }

    async fn submit(&self, job_id: &JobId, _config: &JobConfig) -> ConnectorResult<String> {
        let mut state = self.state();
        state.calls.submit += 1;
        let n = state.calls.submit;
        debug!(provider = %self.name, job_id = %job_id, "Mock submit");
        state.submit_results.pop_front().unwrap_or_else(|| Ok(format!("{}_{n}", self.name)))
    }

    async fn poll_status(&self, _provider_job_id: &str) -> ConnectorResult<ProviderStatus> {
        let mut state = self.state();
        state.calls.poll_status += 1;
        state
            .poll_results
            .pop_front()
            .unwrap_or_else(|| Ok(ProviderStatus::new(ProviderState::Running)))
    }

    async fn stream_logs(&self, _provider_job_id: &str) -> ConnectorResult<Vec<String>> {
        let mut state = self.state();
        state.calls.stream_logs += 1;
        Ok(state.log_batches.pop_front().unwrap_or_default())
    }

    async fn cancel(&self, _provider_job_id: &str) -> ConnectorResult<bool> {
        let mut state = self.state();
        state.calls.cancel += 1;
        state.cancel_result.clone()
    }

    async fn fetch_artifact(&self, _provider_job_id: &str) -> ConnectorResult<Vec<u8>> {
        let mut state = self.state();
        state.calls.fetch_artifact += 1;
        state.artifact.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_results_then_defaults() {
        let connector = MockConnector::new("runpod")
            .with_submit_result(Ok("rp_9".to_string()))
            .with_poll_results([
                Err(ConnectorError::Request("timeout".to_string())),
                Ok(ProviderStatus::new(ProviderState::Completed)),
            ]);
        let config = JobConfig::new("m1", "/d");

        assert_eq!(connector.submit(&JobId::from("a"), &config).await.unwrap(), "rp_9");
        assert_eq!(connector.submit(&JobId::from("b"), &config).await.unwrap(), "runpod_2");

        assert!(connector.poll_status("rp_9").await.is_err());
        assert_eq!(
            connector.poll_status("rp_9").await.unwrap().state,
            ProviderState::Completed
        );
        assert_eq!(connector.poll_status("rp_9").await.unwrap().state, ProviderState::Running);
        assert_eq!(connector.calls().poll_status, 3);
    }
}
