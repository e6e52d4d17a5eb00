//! Lifecycle notifications.
//!
//! Sinks are fire-and-forget: `notify` returns nothing, and nothing a sink does
//! can change job state.

use kiln_training::{JobId, Metrics};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted { provider: String, provider_job_id: Option<String> },
    Log { line: String },
    Metrics { metrics: Metrics },
    Paused,
    Resumed,
    Completed { metrics: Metrics },
    Failed { reason: String },
    Stopped,
    ArtifactReady { artifact_id: String, path: PathBuf, size_bytes: u64, hash_sha256: String },
}

impl JobEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::Log { .. } => "log",
            Self::Metrics { .. } => "metrics",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
            Self::ArtifactReady { .. } => "artifact_ready",
        }
    }

    /// Whether this event ends the job's lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Stopped)
    }
}

/// A notification as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    #[serde(flatten)]
    pub event: JobEvent,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, job_id: &JobId, event: JobEvent);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _job_id: &JobId, _event: JobEvent) {}
}

/// Emits each notification as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, job_id: &JobId, event: JobEvent) {
        match &event {
            JobEvent::Log { line } => info!(job_id = %job_id, "{line}"),
            JobEvent::Failed { reason } => warn!(job_id = %job_id, reason = %reason, "Job failed"),
            other => info!(job_id = %job_id, event = other.event_type(), "Job event"),
        }
    }
}

/// Fans notifications out to any number of subscribers (dashboards, CLIs).
///
/// Sending with no subscribers is not an error; lagging subscribers lose the
/// oldest messages.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<JobNotification>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, job_id: &JobId, event: JobEvent) {
        let _ = self.tx.send(JobNotification { job_id: job_id.clone(), event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        sink.notify(&JobId::from("job-1"), JobEvent::Stopped);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.notify(&JobId::from("job-1"), JobEvent::Log { line: "epoch 1".to_string() });

        let got = rx.recv().await.unwrap();
        assert_eq!(got.job_id, JobId::from("job-1"));
        assert_eq!(got.event, JobEvent::Log { line: "epoch 1".to_string() });
    }

    #[test]
    fn test_notification_serializes_flat() {
        let n = JobNotification {
            job_id: JobId::from("job-1"),
            event: JobEvent::Failed { reason: "oom".to_string() },
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["job_id"], "job-1");
        assert_eq!(value["event"], "failed");
        assert_eq!(value["reason"], "oom");
    }
}
