//! The job record owned by the [`JobStore`](crate::store::JobStore).

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use kiln_connectors::LOCAL_PROVIDER;
use kiln_training::{ArtifactInfo, JobConfig, JobId, JobState, MetricValue, Metrics};
use serde::{Deserialize, Serialize};

/// A training job and everything known about it.
///
/// This is also the persisted record layout: the store writes it as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub config: JobConfig,
    pub state: JobState,
    /// Connector used; set once at submission.
    #[serde(default)]
    pub provider: Option<String>,
    /// Provider's identifier; present iff `provider` is set and is not `local`.
    #[serde(default)]
    pub provider_job_id: Option<String>,
    /// Latest metrics, replaced wholesale on every update.
    #[serde(default)]
    pub current_metrics: Metrics,
    #[serde(default)]
    pub artifact_info: Option<ArtifactInfo>,
    /// Human-readable failure reason.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    #[must_use]
    pub fn new(config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            config,
            state: JobState::Created,
            provider: None,
            provider_job_id: None,
            current_metrics: Metrics::new(),
            artifact_info: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.provider.as_deref() == Some(LOCAL_PROVIDER)
    }

    /// Now, clamped so that no timestamp precedes `created_at`.
    fn now(&self) -> DateTime<Utc> {
        Utc::now().max(self.created_at)
    }

    /// Moves the job to `to`, stamping `started_at`/`completed_at` the first time.
    pub fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(OrchestratorError::transition(
                &self.job_id,
                self.state,
                to,
                "not allowed by the job state machine",
            ));
        }

        let now = self.now();
        if to == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Moves the job to `failed` and records `reason` in both `error` and the
    /// metrics snapshot, so status readers see it without digging through logs.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(JobState::Failed)?;
        let reason = reason.into();
        self.current_metrics.insert("error".to_string(), MetricValue::from(reason.as_str()));
        self.error = Some(reason);
        Ok(())
    }

    pub(crate) fn replace_metrics(&mut self, metrics: Metrics) {
        self.current_metrics = metrics;
        self.updated_at = self.now();
    }

    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            model: self.config.model.clone(),
            state: self.state,
            provider: self.provider.clone(),
            provider_job_id: self.provider_job_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Compact view of a job for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub model: String,
    pub state: JobState,
    pub provider: Option<String>,
    pub provider_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Optional filters for listing jobs. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub provider: Option<String>,
    pub state: Option<JobState>,
}

impl JobFilter {
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(provider) = &self.provider {
            if job.provider.as_deref() != Some(provider.as_str()) {
                return false;
            }
        }
        self.state.is_none_or(|state| job.state == state)
    }
}
