use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for connector calls.
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Errors a connector can report. All of them are recoverable by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorError {
    /// Network or transport failure talking to the provider.
    #[error("Request Error: {0}")]
    Request(String),

    /// The provider answered with an error.
    #[error("Provider Error: {0}")]
    Provider(String),

    /// The provider does not know the given job.
    #[error("Provider job not found: {0}")]
    JobNotFound(String),

    /// The job has produced no downloadable artifact.
    #[error("Artifact not available: {0}")]
    ArtifactUnavailable(String),

    /// The provider rejected the job configuration.
    #[error("Invalid job config: {0}")]
    InvalidConfig(String),

    /// The connector does not implement this capability.
    #[error("Provider '{provider}' does not support {capability}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Capability that was requested.
        capability: String,
    },

    /// No connector is registered under this name.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}
