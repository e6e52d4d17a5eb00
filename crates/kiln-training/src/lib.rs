//! Kiln Training
//!
//! Provider-agnostic training primitives shared by connectors and the orchestrator:
//! - Job configuration and identifiers (`JobConfig`, `JobId`)
//! - The job lifecycle state machine (`JobState`)
//! - Verified artifact records (`ArtifactInfo`) and SHA-256 helpers
//! - In-process training backends (`Trainer`) and their progress reporting

pub mod artifacts;
pub mod error;
pub mod job;
pub mod layout;
pub mod progress;
pub mod state;
pub mod trainer;

pub use artifacts::{sha256_bytes, sha256_file, ArtifactInfo};
pub use error::{TrainingError, TrainingResult};
pub use job::{JobConfig, JobId, MetricValue, Metrics, TrainingHyperParams};
pub use layout::ArtifactLayout;
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink};
pub use state::JobState;
pub use trainer::{
    DryRunTrainer, Trainer, TrainingControl, TrainingHandle, TrainingOutcome, TrainingRequest,
};
