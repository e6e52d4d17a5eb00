//! Job store: the single authoritative map of job id → job record.
//!
//! All mutation goes through [`JobStore::update`], which holds the write lock
//! only for the in-memory edit. Callers must never await a connector while
//! inside an update closure (the closure is synchronous, so they can't).

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobFilter};
use kiln_training::JobId;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Directory of `<job_id>.json` records, if persistence is enabled.
    persist_dir: Option<PathBuf>,
    /// Serializes record writes so the newest snapshot always lands last.
    persist_lock: Mutex<()>,
}

impl fmt::Debug for JobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStore")
            .field("job_count", &self.jobs.try_read().map(|j| j.len()).unwrap_or(0))
            .field("persist_dir", &self.persist_dir)
            .finish_non_exhaustive()
    }
}

impl JobStore {
    /// A store that keeps nothing on disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { jobs: RwLock::new(HashMap::new()), persist_dir: None, persist_lock: Mutex::new(()) }
    }

    /// Opens (or creates) a store persisted under `dir`, loading existing records.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            OrchestratorError::Persistence(format!("create {}: {e}", dir.display()))
        })?;

        let jobs = load_records(&dir)?;
        info!(dir = %dir.display(), jobs = jobs.len(), "Opened job store");

        Ok(Self {
            jobs: RwLock::new(jobs),
            persist_dir: Some(dir),
            persist_lock: Mutex::new(()),
        })
    }

    pub async fn insert(&self, job: Job) -> Result<()> {
        let job_id = job.job_id.clone();
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return Err(OrchestratorError::Persistence(format!("duplicate job id {job_id}")));
            }
            jobs.insert(job_id.clone(), job);
        }
        debug!(job_id = %job_id, "Inserted job");
        self.persist(&job_id).await;
        Ok(())
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).cloned().ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))
    }

    /// Snapshots of all jobs matching `filter`, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut out: Vec<Job> = {
            let jobs = self.jobs.read().await;
            jobs.values().filter(|job| filter.matches(job)).cloned().collect()
        };
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Applies `f` to the job atomically.
    ///
    /// `f` edits a copy; the copy replaces the stored record only if `f`
    /// returns `Ok`, so a rejected transition leaves the record untouched.
    pub async fn update<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<T>,
    ) -> Result<T> {
        let value = {
            let mut jobs = self.jobs.write().await;
            let current =
                jobs.get(job_id).ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
            let mut next = current.clone();
            let value = f(&mut next)?;
            if next != *current {
                jobs.insert(job_id.clone(), next);
            }
            value
        };
        self.persist(job_id).await;
        Ok(value)
    }

    /// Writes the latest record for `job_id`. Failures are logged; the
    /// in-memory record stays authoritative.
    async fn persist(&self, job_id: &JobId) {
        let Some(dir) = &self.persist_dir else {
            return;
        };

        let _guard = self.persist_lock.lock().await;
        let Ok(job) = self.get(job_id).await else {
            return;
        };
        if let Err(e) = write_record(dir, &job).await {
            error!(job_id = %job_id, error = %e, "Failed to persist job record");
        }
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn record_path(dir: &Path, job_id: &JobId) -> PathBuf {
    dir.join(format!("{job_id}.json"))
}

async fn write_record(dir: &Path, job: &Job) -> std::io::Result<()> {
    let path = record_path(dir, &job.job_id);
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(job)?;
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await
}

fn load_records(dir: &Path) -> Result<HashMap<JobId, Job>> {
    let read_err = |e: std::io::Error| OrchestratorError::Persistence(format!("read {}: {e}", dir.display()));
    let mut jobs = HashMap::new();

    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = std::fs::read(&path).map_err(read_err)?;
        let job: Job = serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::Persistence(format!("parse {}: {e}", path.display()))
        })?;
        jobs.insert(job.job_id.clone(), job);
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::{JobConfig, JobState};
    use tempfile::TempDir;

    fn job(model: &str) -> Job {
        Job::new(JobConfig::new(model, "/d"))
    }

    #[tokio::test]
    async fn test_insert_get_and_missing() {
        let store = JobStore::in_memory();
        let job = job("m1");
        let id = job.job_id.clone();
        store.insert(job).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap().config.model, "m1");
        assert!(matches!(
            store.get(&JobId::from("nope")).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record_untouched() {
        let store = JobStore::in_memory();
        let job = job("m1");
        let id = job.job_id.clone();
        store.insert(job).await.unwrap();

        let result = store
            .update(&id, |job| {
                job.provider = Some("runpod".to_string());
                job.transition(JobState::Completed)
            })
            .await;
        assert!(result.is_err());

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Created);
        assert_eq!(stored.provider, None);
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_filtered() {
        let store = JobStore::in_memory();
        for model in ["a", "b", "c"] {
            store.insert(job(model)).await.unwrap();
        }
        let all = store.list(&JobFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let running = store.list(&JobFilter::default().state(JobState::Running)).await;
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let id = {
            let store = JobStore::open(temp.path()).unwrap();
            let job = job("m1");
            let id = job.job_id.clone();
            store.insert(job).await.unwrap();
            store
                .update(&id, |job| {
                    job.transition(JobState::Initializing)?;
                    job.fail("provider down")
                })
                .await
                .unwrap();
            id
        };

        let reopened = JobStore::open(temp.path()).unwrap();
        let job = reopened.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("provider down"));
    }
}
