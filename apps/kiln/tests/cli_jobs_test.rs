//! Integration tests for the `kiln run`, `kiln jobs` and `kiln providers` commands.

use assert_cmd::Command;
use kiln_orchestrator::{Job, JobStore};
use kiln_training::{JobConfig, JobId, JobState};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// `kiln` isolated from the user's config and job store.
fn kiln(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.current_dir(temp_dir.path())
        .env("HOME", temp_dir.path())
        .arg("--state-dir")
        .arg(temp_dir.path().join("jobs"));
    cmd
}

fn write_dataset(temp_dir: &TempDir) -> std::path::PathBuf {
    let path = temp_dir.path().join("train.jsonl");
    fs::write(&path, "{\"text\": \"hello\"}\n{\"text\": \"world\"}\n").unwrap();
    path
}

fn run_job(temp_dir: &TempDir) -> serde_json::Value {
    let dataset = write_dataset(temp_dir);
    let output = kiln(temp_dir)
        .args(["run", "--model", "m1", "--max-steps", "3", "--step-delay-ms", "1", "--json"])
        .arg("--dataset")
        .arg(&dataset)
        .output()
        .unwrap();
    assert!(output.status.success(), "run failed: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_run_completes_local_job() {
    let temp_dir = TempDir::new().unwrap();
    let job = run_job(&temp_dir);

    assert_eq!(job["state"], "completed");
    assert_eq!(job["provider"], "local");
    assert_eq!(job["current_metrics"]["step"], 3.0);
    assert!(job["artifact_info"]["hash_sha256"].as_str().unwrap().len() == 64);
    assert!(temp_dir.path().join(".kiln").join("artifacts").is_dir());
}

#[test]
fn test_run_streams_events() {
    let temp_dir = TempDir::new().unwrap();
    let dataset = write_dataset(&temp_dir);

    kiln(&temp_dir)
        .args(["run", "--model", "m1", "--max-steps", "2", "--step-delay-ms", "1"])
        .arg("--dataset")
        .arg(&dataset)
        .assert()
        .success()
        .stdout(predicate::str::contains("submitted"))
        .stdout(predicate::str::contains("Finished:"));
}

#[test]
fn test_run_with_missing_dataset_fails() {
    let temp_dir = TempDir::new().unwrap();

    kiln(&temp_dir)
        .args(["run", "--model", "m1", "--dataset", "missing.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dataset not found"));
}

#[test]
fn test_jobs_list_and_status() {
    let temp_dir = TempDir::new().unwrap();
    let job = run_job(&temp_dir);
    let id = job["job_id"].as_str().unwrap();

    kiln(&temp_dir)
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id));

    kiln(&temp_dir)
        .args(["jobs", "list", "--state", "failed", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));

    kiln(&temp_dir)
        .args(["jobs", "status", id, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"completed\""));
}

#[test]
fn test_jobs_list_empty() {
    let temp_dir = TempDir::new().unwrap();

    kiln(&temp_dir)
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No jobs found"));
}

#[test]
fn test_jobs_status_unknown_id() {
    let temp_dir = TempDir::new().unwrap();

    kiln(&temp_dir)
        .args(["jobs", "status", "job_missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No job with id job_missing"));
}

#[test]
fn test_invalid_state_filter_is_rejected() {
    let temp_dir = TempDir::new().unwrap();

    kiln(&temp_dir).args(["jobs", "list", "--state", "sleeping"]).assert().failure();
}

#[test]
fn test_providers_lists_local() {
    let temp_dir = TempDir::new().unwrap();

    kiln(&temp_dir)
        .args(["providers", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"local\""))
        .stdout(predicate::str::contains("\"available\": true"));
}

/// Persists a local job stuck in `running`, as a killed `kiln run` leaves it.
fn seed_interrupted_job(temp_dir: &TempDir) -> JobId {
    let mut job = Job::new(JobConfig::new("m1", write_dataset(temp_dir)));
    job.provider = Some("local".to_string());
    job.transition(JobState::Initializing).unwrap();
    job.transition(JobState::Running).unwrap();
    let job_id = job.job_id.clone();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let store = JobStore::open(temp_dir.path().join("jobs")).unwrap();
        store.insert(job).await.unwrap();
    });
    job_id
}

#[test]
fn test_run_fails_jobs_interrupted_by_earlier_process() {
    let temp_dir = TempDir::new().unwrap();
    let orphan = seed_interrupted_job(&temp_dir);

    let job = run_job(&temp_dir);
    assert_eq!(job["state"], "completed");

    kiln(&temp_dir)
        .args(["jobs", "status", orphan.as_str(), "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"failed\""))
        .stdout(predicate::str::contains("interrupted by restart"));
}
