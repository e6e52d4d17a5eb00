// Error types for the training job orchestrator

use kiln_connectors::ConnectorError;
use kiln_training::{JobId, JobState};
use std::path::PathBuf;
use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Job config is missing required fields or has invalid values
    #[error("Invalid job config: {0}")]
    InvalidConfig(String),

    /// No connector is registered under this provider name
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The requested operation is not allowed from the job's current state
    #[error("Invalid state transition for job {job_id}: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// Job the operation targeted
        job_id: JobId,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
        /// Why the transition was refused
        reason: String,
    },

    /// The provider rejected or failed the submission
    #[error("Submission to '{provider}' failed: {source}")]
    Submission {
        /// Provider name
        provider: String,
        /// Underlying connector error
        #[source]
        source: ConnectorError,
    },

    /// A monitor gave up after too many consecutive poll failures
    #[error("Monitoring error: {0}")]
    Monitoring(String),

    /// The job has no artifact that can be downloaded
    #[error("Artifact not available for job {job_id}: {reason}")]
    ArtifactNotAvailable {
        /// Job the download targeted
        job_id: JobId,
        /// Why nothing can be downloaded
        reason: String,
    },

    /// Writing or hashing the artifact on local storage failed
    #[error("Artifact IO error at {}: {source}", path.display())]
    ArtifactIo {
        /// File being written
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A connector call other than submit failed
    #[error("Provider '{provider}' error: {source}")]
    Connector {
        /// Provider name
        provider: String,
        /// Underlying connector error
        #[source]
        source: ConnectorError,
    },

    /// No job with this id
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Job records could not be loaded from or saved to disk
    #[error("Job persistence error: {0}")]
    Persistence(String),
}

impl OrchestratorError {
    pub(crate) fn transition(
        job_id: &JobId,
        from: JobState,
        to: JobState,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition { job_id: job_id.clone(), from, to, reason: reason.into() }
    }
}
