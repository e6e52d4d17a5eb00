//! Restart recovery against a persisted job store.

use kiln_connectors::{ConnectorRegistry, MockConnector, ProviderState, ProviderStatus, LOCAL_PROVIDER};
use kiln_orchestrator::{Job, JobStore, MonitorConfig, Orchestrator, OrchestratorConfig};
use kiln_training::{JobConfig, JobId, JobState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        monitor: MonitorConfig {
            poll_interval: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        },
        artifact_root: root.join("artifacts"),
    }
}

fn orchestrator(store: Arc<JobStore>, connector: &Arc<MockConnector>, root: &Path) -> Orchestrator {
    let registry = ConnectorRegistry::new().with(Arc::clone(connector) as _);
    Orchestrator::builder(registry).store(store).config(config(root)).build()
}

async fn insert_orphan(store: &JobStore, provider: &str, path: &[JobState]) -> JobId {
    let mut job = Job::new(JobConfig::new("m1", "/d"));
    job.provider = Some(provider.to_string());
    for state in path {
        job.transition(*state).unwrap();
    }
    let id = job.job_id.clone();
    store.insert(job).await.unwrap();
    id
}

#[tokio::test]
async fn test_monitoring_resumes_after_restart() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join("jobs");

    let id = {
        let connector = Arc::new(MockConnector::new("runpod"));
        let store = Arc::new(JobStore::open(&state_dir).unwrap());
        let first = orchestrator(store, &connector, temp.path());
        let job = first.create_job(JobConfig::new("m1", "/d")).await.unwrap();
        first.submit(&job.job_id, "runpod").await.unwrap();
        first.shutdown().await;
        job.job_id
    };

    // Shutdown detaches without cancelling the remote job.
    let store = Arc::new(JobStore::open(&state_dir).unwrap());
    let reloaded = store.get(&id).await.unwrap();
    assert_eq!(reloaded.state, JobState::Running);
    assert_eq!(reloaded.provider_job_id.as_deref(), Some("runpod_1"));

    let connector = Arc::new(
        MockConnector::new("runpod")
            .with_poll_results([Ok(ProviderStatus::new(ProviderState::Completed))]),
    );
    let second = orchestrator(Arc::clone(&store), &connector, temp.path());
    assert_eq!(second.recover().await.unwrap(), 1);

    let job = second.wait_for_terminal(&id, Duration::from_millis(5)).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(connector.calls().cancel, 0);

    // The terminal state reached disk as well.
    let on_disk = JobStore::open(&state_dir).unwrap().get(&id).await.unwrap();
    assert_eq!(on_disk.state, JobState::Completed);
}

#[tokio::test]
async fn test_orphaned_jobs_are_failed() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JobStore::open(temp.path().join("jobs")).unwrap());

    let submitting = insert_orphan(&store, "runpod", &[JobState::Initializing]).await;
    let local = insert_orphan(
        &store,
        LOCAL_PROVIDER,
        &[JobState::Initializing, JobState::Running, JobState::Paused],
    )
    .await;
    let gone = {
        let mut job = Job::new(JobConfig::new("m1", "/d"));
        job.provider = Some("lambda".to_string());
        job.provider_job_id = Some("lam_1".to_string());
        job.transition(JobState::Initializing).unwrap();
        job.transition(JobState::Running).unwrap();
        let id = job.job_id.clone();
        store.insert(job).await.unwrap();
        id
    };
    let untouched = store.insert(Job::new(JobConfig::new("m1", "/d"))).await;
    assert!(untouched.is_ok());

    let connector = Arc::new(MockConnector::new("runpod"));
    let orchestrator = orchestrator(Arc::clone(&store), &connector, temp.path());
    assert_eq!(orchestrator.recover().await.unwrap(), 0);

    for id in [&submitting, &local, &gone] {
        let job = store.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed, "job {id} should have failed");
        assert!(job.error.is_some());
    }
    assert!(store.get(&gone).await.unwrap().error.unwrap().contains("lambda"));
    assert_eq!(orchestrator.active_monitors().await, 0);
    assert_eq!(connector.calls().poll_status, 0);
}
