use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tempfile::TempDir;

use dog_jobs::{
    handler_fn, BackoffPolicy, Clock, FailureKind, JobId, JobManager, JobOptions, JobPriority, JobRecord,
    JobStatus, JobStorage, JobsConfig, FileStorage, ManualClock, TaskArgs,
};

/// Test factory functions
fn fast_config() -> JobsConfig {
    JobsConfig::default()
        .with_worker_count(1)
        .with_poll_interval(Duration::from_millis(10))
        .with_scheduler_interval(Duration::from_millis(20))
        .with_backoff(BackoffPolicy::fixed(Duration::ZERO))
        .with_stale_after(Duration::from_secs(60))
}

fn create_job(task_name: &str, now: chrono::DateTime<chrono::Utc>) -> JobRecord {
    JobRecord::new(task_name, vec![json!(1)], Map::new(), "default", JobPriority::Normal, now, 3, now)
}

async fn wait_for_status(manager: &JobManager, id: &JobId, status: JobStatus) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        assert!(tokio::time::Instant::now() < deadline, "Timeout waiting for {:?}: {:?}", status, job);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// F1. Records survive reopening the file
#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");

    // Arrange
    let now = chrono::Utc::now();
    let job = create_job("report", now);
    {
        let storage = FileStorage::open(&path).await.unwrap();
        storage.save(&job).await.unwrap();
        let claimed = storage.claim(&job.id, now).await.unwrap();
        assert!(claimed.is_some());
    }

    // Act
    let reopened = FileStorage::open(&path).await.unwrap();

    // Assert
    let loaded = reopened.get(&job.id).await.unwrap();
    assert_eq!(loaded.status, JobStatus::Running);
    assert_eq!(loaded.args, vec![json!(1)]);
    assert!(loaded.heartbeat_at.is_some());
}

/// F2. A missing file starts empty and writes leave no temp file behind
#[tokio::test]
async fn test_fresh_file_and_atomic_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");

    let storage = FileStorage::open(&path).await.unwrap();
    assert!(storage.get_jobs_by_status(&[JobStatus::Pending]).await.unwrap().is_empty());

    let job = create_job("report", chrono::Utc::now());
    storage.save(&job).await.unwrap();
    assert!(storage.delete(&job.id).await.unwrap());
    assert!(!storage.delete(&job.id).await.unwrap());

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("jobs.json")]);
}

/// F3. Rejected writes are not persisted
#[tokio::test]
async fn test_rejected_update_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");
    let storage = FileStorage::open(&path).await.unwrap();

    let mut job = create_job("report", chrono::Utc::now());
    storage.save(&job).await.unwrap();
    job.complete(json!("done"), chrono::Utc::now());
    assert!(storage.update(&job).await.is_err());

    let reopened = FileStorage::open(&path).await.unwrap();
    assert_eq!(reopened.get(&job.id).await.unwrap().status, JobStatus::Pending);
}

/// G1. Pending jobs from a previous process run after restart
#[tokio::test]
async fn test_pending_jobs_run_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");

    let id = {
        let manager = JobManager::with_config(FileStorage::open(&path).await.unwrap(), fast_config());
        manager
            .enqueue("echo", vec![json!("persisted")], Map::new(), JobOptions::new())
            .await
            .unwrap()
    };

    let manager = JobManager::with_config(FileStorage::open(&path).await.unwrap(), fast_config());
    manager.register_task(
        "echo",
        handler_fn(|args: TaskArgs| async move { Ok(args.to_value()) }),
        None,
        None,
        None,
    );
    manager.start().await.unwrap();

    let job = wait_for_status(&manager, &id, JobStatus::Completed).await;
    assert_eq!(job.result, Some(json!({"args": ["persisted"], "kwargs": {}})));
    manager.stop().await.unwrap();

    let reopened = FileStorage::open(&path).await.unwrap();
    assert_eq!(reopened.get(&id).await.unwrap().status, JobStatus::Completed);
}

/// G2. A job left RUNNING by a crash is retried once it goes stale
#[tokio::test]
async fn test_crashed_running_job_is_recovered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");
    let clock = ManualClock::starting_now();

    // Arrange: the previous process claimed the job and died
    let job = create_job("echo", clock.now());
    {
        let storage = FileStorage::open(&path).await.unwrap();
        storage.save(&job).await.unwrap();
        storage.claim(&job.id, clock.now()).await.unwrap().unwrap();
    }

    // Act
    clock.advance(chrono::Duration::minutes(5));
    let storage = Arc::new(FileStorage::open(&path).await.unwrap());
    let manager = JobManager::from_parts(storage.clone(), fast_config(), Arc::new(clock.clone()));
    let recovered = manager.recover().await.unwrap();

    // Assert
    assert_eq!(recovered, 1);
    let record = storage.get(&job.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.retries, 1);
    assert_eq!(record.error.map(|e| e.kind), Some(FailureKind::Stale));
    assert!(manager.queue().contains(&job.id));
}
