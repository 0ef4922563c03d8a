use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::JobTable;
use super::JobStorage;
use crate::{JobId, JobRecord, JobStatus, JobsResult};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    jobs: Vec<&'a JobRecord>,
}

#[derive(Deserialize)]
struct Snapshot {
    #[allow(dead_code)]
    version: u32,
    jobs: Vec<JobRecord>,
}

/// Storage persisted as a single JSON snapshot file
///
/// Every mutation rewrites the snapshot (temp file, then rename) before it
/// becomes visible, so a record that was saved survives a process crash and
/// is loaded again by [`FileStorage::open`].
pub struct FileStorage {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileStorage {
    /// Open the snapshot at `path`, starting empty if it does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> JobsResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!("Loaded {} jobs from {}", snapshot.jobs.len(), path.display());
                JobTable::from_records(snapshot.jobs)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                JobTable::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &JobTable) -> JobsResult<()> {
        let mut jobs: Vec<&JobRecord> = table.records().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let bytes = serde_json::to_vec_pretty(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            jobs,
        })?;

        // Flushed to disk before the rename makes it the live snapshot
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `change` to a copy of the table and swap it in once the snapshot is on disk
    async fn mutate<T>(&self, change: impl FnOnce(&mut JobTable) -> JobsResult<T>) -> JobsResult<T> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *table = next;
        Ok(out)
    }
}

#[async_trait]
impl JobStorage for FileStorage {
    async fn save(&self, job: &JobRecord) -> JobsResult<()> {
        self.mutate(|table| table.save(job)).await
    }

    async fn get(&self, id: &JobId) -> JobsResult<JobRecord> {
        self.table.lock().await.get(id)
    }

    async fn update(&self, job: &JobRecord) -> JobsResult<()> {
        self.mutate(|table| table.update(job)).await
    }

    async fn claim(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<Option<JobRecord>> {
        self.mutate(|table| table.claim(id, now)).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> JobsResult<bool> {
        self.mutate(|table| table.heartbeat(id, now)).await
    }

    async fn get_jobs_by_status(&self, statuses: &[JobStatus]) -> JobsResult<Vec<JobRecord>> {
        Ok(self.table.lock().await.by_status(statuses))
    }

    async fn get_queue_length(&self, queue_name: &str) -> JobsResult<usize> {
        Ok(self.table.lock().await.queue_length(queue_name))
    }

    async fn clear(&self, queue_name: &str, now: DateTime<Utc>) -> JobsResult<usize> {
        self.mutate(|table| Ok(table.clear(queue_name, now))).await
    }

    async fn delete(&self, id: &JobId) -> JobsResult<bool> {
        self.mutate(|table| Ok(table.delete(id))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobsError;

    #[tokio::test]
    async fn corrupt_snapshot_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let err = FileStorage::open(&path).await.err().unwrap();
        assert!(matches!(err, JobsError::Serialization(_)));
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");

        let storage = FileStorage::open(&path).await.unwrap();
        assert!(storage.get_jobs_by_status(&[JobStatus::Pending]).await.unwrap().is_empty());
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn every_write_leaves_a_complete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let storage = FileStorage::open(&path).await.unwrap();

        let now = Utc::now();
        let job = JobRecord::new("report", vec![], Default::default(), "default", Default::default(), now, 3, now);
        storage.save(&job).await.unwrap();
        storage.claim(&job.id, now).await.unwrap();

        let snapshot: Snapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].status, JobStatus::Running);
        assert!(!path.with_extension("tmp").exists());
    }
}
