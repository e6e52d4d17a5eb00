//! Registry entry for in-process training.
//!
//! The orchestrator drives local jobs itself through a `Trainer`; this connector
//! only validates submissions and gives the network-facing capabilities
//! degenerate answers.

use crate::connector::{Connector, ProviderStatus};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use kiln_training::{JobConfig, JobId};

/// Provider name reserved for in-process execution.
pub const LOCAL_PROVIDER: &str = "local";

#[derive(Debug, Default, Clone)]
pub struct LocalConnector;

impl LocalConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn unsupported(capability: &str) -> ConnectorError {
        ConnectorError::Unsupported {
            provider: LOCAL_PROVIDER.to_string(),
            capability: capability.to_string(),
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    async fn submit(&self, job_id: &JobId, config: &JobConfig) -> ConnectorResult<String> {
        config.validate().map_err(|e| ConnectorError::InvalidConfig(e.to_string()))?;
        if !config.dataset_path.exists() {
            return Err(ConnectorError::InvalidConfig(format!(
                "dataset not found: {}",
                config.dataset_path.display()
            )));
        }
        Ok(job_id.to_string())
    }

    async fn poll_status(&self, _provider_job_id: &str) -> ConnectorResult<ProviderStatus> {
        Err(Self::unsupported("poll_status"))
    }

    async fn stream_logs(&self, _provider_job_id: &str) -> ConnectorResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn cancel(&self, _provider_job_id: &str) -> ConnectorResult<bool> {
        Ok(true)
    }

    async fn fetch_artifact(&self, _provider_job_id: &str) -> ConnectorResult<Vec<u8>> {
        Err(Self::unsupported("fetch_artifact"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_requires_existing_dataset() {
        let connector = LocalConnector::new();
        let config = JobConfig::new("m1", "/definitely/not/here.jsonl");
        let result = connector.submit(&JobId::from("job-1"), &config).await;
        assert!(matches!(result, Err(ConnectorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_network_capabilities_are_degenerate() {
        let connector = LocalConnector::new();
        assert!(connector.stream_logs("x").await.unwrap().is_empty());
        assert!(connector.cancel("x").await.unwrap());
        assert!(matches!(
            connector.fetch_artifact("x").await,
            Err(ConnectorError::Unsupported { .. })
        ));
    }
}
