//! Artifact persistence and verification.

use crate::error::{OrchestratorError, Result};
use crate::job::Job;
use kiln_training::{ArtifactInfo, ArtifactLayout, TrainingError};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Writes trained artifacts into job-scoped directories and records their digests.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    layout: ArtifactLayout,
}

impl ArtifactManager {
    #[must_use]
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Persists downloaded `bytes` for `job` and returns the verified record.
    ///
    /// The file is written to a temporary sibling and renamed into place, so a
    /// failed write never clobbers a previously stored artifact. The digest is
    /// computed from the file as it sits on disk after the rename. A job's
    /// `artifact_id` is kept across re-downloads.
    pub async fn store_download(&self, job: &Job, bytes: Vec<u8>) -> Result<ArtifactInfo> {
        let layout = self.layout.clone();
        let job_id = job.job_id.clone();
        let artifact_id = job.artifact_info.as_ref().map(|a| a.artifact_id.clone());
        let metadata = provenance(job);
        let path = layout.adapter_path(&job_id);

        let target = path.clone();
        let info = tokio::task::spawn_blocking(move || -> Result<ArtifactInfo> {
            let dir = layout.ensure_job_dir(&job_id).map_err(|e| io_error(&target, e))?;
            write_atomically(&dir, &target, &bytes).map_err(|e| io_error(&target, e.into()))?;
            let info = ArtifactInfo::from_file(artifact_id, job_id.clone(), target.clone(), metadata)
                .map_err(|e| io_error(&target, e))?;
            let manifest = layout.manifest_path(&job_id);
            write_manifest(&manifest, &info).map_err(|e| io_error(&manifest, e.into()))?;
            Ok(info)
        })
        .await
        .map_err(|e| OrchestratorError::ArtifactIo { path, source: std::io::Error::other(e) })??;

        info!(
            job_id = %job.job_id,
            path = %info.path.display(),
            size_bytes = info.size_bytes,
            sha256 = %info.hash_sha256,
            "Stored artifact"
        );
        Ok(info)
    }

    /// Records a file produced by in-process training.
    pub async fn record_local(&self, job: &Job, path: PathBuf) -> Result<ArtifactInfo> {
        let job_id = job.job_id.clone();
        let metadata = provenance(job);
        let err_path = path.clone();

        let info = tokio::task::spawn_blocking(move || {
            ArtifactInfo::from_file(None, job_id, path, metadata)
        })
        .await
        .map_err(|e| OrchestratorError::ArtifactIo {
            path: err_path.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|e| io_error(&err_path, e))?;

        debug!(job_id = %job.job_id, path = %info.path.display(), "Recorded local artifact");
        Ok(info)
    }
}

fn provenance(job: &Job) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("model".to_string(), job.config.model.clone());
    if let Some(provider) = &job.provider {
        metadata.insert("provider".to_string(), provider.clone());
    }
    if let Some(provider_job_id) = &job.provider_job_id {
        metadata.insert("provider_job_id".to_string(), provider_job_id.clone());
    }
    metadata
}

fn io_error(path: &Path, error: TrainingError) -> OrchestratorError {
    let source = match error {
        TrainingError::Io(e) => e,
        other => std::io::Error::other(other.to_string()),
    };
    OrchestratorError::ArtifactIo { path: path.to_path_buf(), source }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // Unique per call; concurrent writers to the same job never share a temp file.
    let tmp = dir.join(format!(
        ".{}.{}.part",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact"),
        Uuid::new_v4().simple()
    ));
    let written = write_and_rename(&tmp, path, bytes);
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp, path)
}

fn write_manifest(path: &Path, info: &ArtifactInfo) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(info)?;
    std::fs::write(path, json)
}
