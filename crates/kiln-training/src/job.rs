use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single metric reported by a trainer or provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u64> for MetricValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => n.fmt(f),
            Self::Text(s) => s.fmt(f),
        }
    }
}

/// Latest metric snapshot, keyed by metric name (`step`, `epoch`, `loss`, ...).
pub type Metrics = BTreeMap<String, MetricValue>;

/// Immutable description of what to train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Base model identifier (provider-specific, e.g. a Hugging Face repo id).
    pub model: String,
    /// Path to the training dataset.
    #[serde(alias = "dataset")]
    pub dataset_path: PathBuf,
    /// Where trained output should land. Defaults to the job's artifact directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub hyperparams: TrainingHyperParams,
    /// Provider-specific knobs passed through untouched (gpu type, region, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobConfig {
    #[must_use]
    pub fn new(model: impl Into<String>, dataset_path: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            dataset_path: dataset_path.into(),
            output_dir: None,
            hyperparams: TrainingHyperParams::default(),
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    #[must_use]
    pub fn with_hyperparams(mut self, hyperparams: TrainingHyperParams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.model.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("model is required".to_string()));
        }
        if self.dataset_path.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("dataset_path is required".to_string()));
        }
        self.hyperparams.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub epochs: u32,
    /// Hard cap on optimizer steps. When unset, trainers derive it from `epochs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub max_seq_len: u32,
    pub lora_rank: u32,
    pub lora_alpha: u32,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 1,
            max_steps: None,
            learning_rate: 2e-4,
            batch_size: 1,
            max_seq_len: 2048,
            lora_rank: 16,
            lora_alpha: 32,
        }
    }
}

impl TrainingHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.max_steps == Some(0) {
            return Err(TrainingError::InvalidConfig("max_steps must be >= 1".to_string()));
        }
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.max_seq_len == 0 {
            return Err(TrainingError::InvalidConfig("max_seq_len must be >= 1".to_string()));
        }
        if self.lora_rank == 0 {
            return Err(TrainingError::InvalidConfig("lora_rank must be >= 1".to_string()));
        }
        Ok(())
    }
}
