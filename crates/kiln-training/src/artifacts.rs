use crate::error::{TrainingError, TrainingResult};
use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The verified output of a training job.
///
/// `hash_sha256` is always the digest of the bytes at `path` as they were when
/// the record was built; records are only constructed from files that already exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub artifact_id: String,
    pub job_id: JobId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub hash_sha256: String,
    pub created_at: DateTime<Utc>,
    /// Free-form provenance (`provider`, `provider_job_id`, `model`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactInfo {
    /// Build a record for a file that has already been fully written.
    pub fn from_file(
        artifact_id: Option<String>,
        job_id: JobId,
        path: PathBuf,
        metadata: BTreeMap<String, String>,
    ) -> TrainingResult<Self> {
        if !path.is_file() {
            return Err(TrainingError::Artifact(format!(
                "artifact path does not exist: {}",
                path.display()
            )));
        }

        let bytes = std::fs::read(&path)?;
        Ok(Self {
            artifact_id: artifact_id.unwrap_or_else(|| format!("art_{}", Uuid::new_v4().simple())),
            job_id,
            size_bytes: bytes.len() as u64,
            hash_sha256: sha256_bytes(&bytes),
            path,
            created_at: Utc::now(),
            metadata,
        })
    }

    /// Re-hash the file at `path` and compare against the recorded digest.
    pub fn verify(&self) -> TrainingResult<bool> {
        Ok(sha256_file(&self.path)? == self.hash_sha256)
    }
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}
