use crate::error::TrainingResult;
use crate::job::JobId;
use std::path::{Path, PathBuf};

/// Filesystem layout for job artifacts.
///
/// Default layout is under `<root>/<job_id>/...`; one job never writes into
/// another job's directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    /// Where a downloaded provider artifact is stored.
    #[must_use]
    pub fn adapter_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("adapter.bin")
    }

    #[must_use]
    pub fn manifest_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("artifact_manifest.json")
    }

    /// Default output directory for in-process training.
    #[must_use]
    pub fn local_output_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("output")
    }

    pub fn ensure_job_dir(&self, job_id: &JobId) -> TrainingResult<PathBuf> {
        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths_are_job_scoped() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path().join("artifacts"));
        let a = JobId::from("job-a");
        let b = JobId::from("job-b");

        assert_eq!(layout.root(), temp.path().join("artifacts"));
        assert!(layout.adapter_path(&a).starts_with(layout.job_dir(&a)));
        assert!(!layout.adapter_path(&a).starts_with(layout.job_dir(&b)));
    }

    #[test]
    fn test_ensure_job_dir_creates_directory() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path().join("artifacts"));
        let dir = layout.ensure_job_dir(&JobId::from("job-1")).unwrap();
        assert!(dir.is_dir());
    }
}
