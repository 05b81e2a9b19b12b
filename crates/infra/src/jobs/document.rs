//! Embedded document job store.
//!
//! The whole collection lives in memory behind an async `RwLock` and, when
//! opened from a file, is written back on every mutation as one JSON document
//! (`<file>.tmp` then rename). A failed write rolls the in-memory change back,
//! so memory and disk never disagree about an acknowledged mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use docflow_core::{
    JobId, JobPage, JobPaths, JobQuery, JobRecord, JobStatus, StatusUpdate, clamp_page, time,
};

use super::store::{JobStore, JobStoreError, window_start};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    jobs: Vec<JobRecord>,
}

/// Document-collection job store.
#[derive(Debug)]
pub struct DocumentJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    file: Option<PathBuf>,
}

impl DocumentJobStore {
    /// Memory-only collection, used by tests.
    pub fn in_memory() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            file: None,
        }
    }

    /// Open (or create) the collection file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage("create collection directory", &path, e))?;
        }

        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => {
                let collection: Collection = serde_json::from_slice(&bytes).map_err(|e| {
                    JobStoreError::Corrupt(format!("{}: {e}", path.display()))
                })?;
                collection.jobs.into_iter().map(|j| (j.id, j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(storage("read collection", &path, e)),
        };

        info!(path = %path.display(), jobs = jobs.len(), "document job store opened");
        Ok(Self {
            jobs: RwLock::new(jobs),
            file: Some(path),
        })
    }

    async fn persist(&self, jobs: &HashMap<JobId, JobRecord>) -> Result<(), JobStoreError> {
        let Some(path) = &self.file else {
            return Ok(());
        };

        let mut all: Vec<JobRecord> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let bytes = serde_json::to_vec(&Collection { jobs: all })
            .map_err(|e| JobStoreError::Storage(format!("failed to encode collection: {e}")))?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage("write collection", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage("replace collection", path, e))
    }

    /// Apply `f` to a copy of one record, persist, then commit. Errors from
    /// `f` or from the write leave the collection untouched.
    async fn mutate<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let mut next = jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))?;
        let out = f(&mut next)?;
        let previous = jobs.insert(id, next);
        if let Err(e) = self.persist(&jobs).await {
            if let Some(previous) = previous {
                jobs.insert(id, previous);
            }
            return Err(e);
        }
        Ok(out)
    }

    async fn most_recent<P>(&self, predicate: P) -> Option<JobRecord>
    where
        P: Fn(&JobRecord) -> bool,
    {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|j| predicate(j))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned()
    }

    async fn oldest_first<P>(&self, predicate: P) -> Vec<JobRecord>
    where
        P: Fn(&JobRecord) -> bool,
    {
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobRecord> = jobs.values().filter(|j| predicate(j)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

impl Default for DocumentJobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait::async_trait]
impl JobStore for DocumentJobStore {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_paged_filtered(
        &self,
        page: u32,
        page_size: u32,
        query: &JobQuery,
    ) -> Result<JobPage, JobStoreError> {
        let (page, page_size) = clamp_page(page, page_size);
        let jobs = self.jobs.read().await;

        let mut matching: Vec<&JobRecord> = jobs.values().filter(|j| query.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let offset = usize::try_from(JobPage::offset(page, page_size)).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn create(&self, mut record: JobRecord) -> Result<JobRecord, JobStoreError> {
        let now = time::now();
        record.created_at = now;
        record.updated_at = now;
        record.available_at = record.available_at.map(time::truncate);
        record.lease_until = record.lease_until.map(time::truncate);
        record.metrics.started_at = record.metrics.started_at.map(time::truncate);
        record.metrics.ended_at = record.metrics.ended_at.map(time::truncate);

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, record.clone());
        if let Err(e) = self.persist(&jobs).await {
            jobs.remove(&record.id);
            return Err(e);
        }

        info!(job_id = %record.id, status = %record.status, "job created");
        Ok(record)
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<(), JobStoreError> {
        let update = StatusUpdate {
            started_at: update.started_at.map(time::truncate),
            ended_at: update.ended_at.map(time::truncate),
            ..update
        };
        let from = self
            .mutate(id, |job| {
                let from = job.status;
                job.apply_status(&update, time::now())
                    .map_err(|_| JobStoreError::InvalidTransition {
                        id,
                        from,
                        to: update.status,
                    })?;
                Ok(from)
            })
            .await?;

        match update.status {
            JobStatus::Failed | JobStatus::Cancelled => warn!(
                job_id = %id,
                from = %from,
                to = %update.status,
                error = update.error_message.as_deref().unwrap_or(""),
                "job status updated"
            ),
            _ => debug!(job_id = %id, from = %from, to = %update.status, "job status updated"),
        }
        Ok(())
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobStoreError> {
        self.mutate(id, |job| {
            job.set_progress(progress, time::now());
            Ok(())
        })
        .await?;
        debug!(job_id = %id, progress, "job progress updated");
        Ok(())
    }

    async fn increment_attempts(&self, id: JobId) -> Result<u32, JobStoreError> {
        let attempts = self
            .mutate(id, |job| Ok(job.increment_attempts(time::now())))
            .await?;
        debug!(job_id = %id, attempts, "job attempts incremented");
        Ok(attempts)
    }

    async fn touch_lease(
        &self,
        id: JobId,
        lease_until: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.mutate(id, |job| {
            job.touch_lease(time::truncate(lease_until), time::now());
            Ok(())
        })
        .await?;
        debug!(job_id = %id, %lease_until, "job lease touched");
        Ok(())
    }

    async fn update_paths(&self, id: JobId, paths: JobPaths) -> Result<(), JobStoreError> {
        self.mutate(id, |job| {
            job.set_paths(paths, time::now());
            Ok(())
        })
        .await
    }

    async fn count_pending(&self) -> Result<u64, JobStoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.status.is_pending()).count() as u64)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let since = window_start(ttl);
        Ok(self
            .most_recent(|j| j.idempotency_key.as_deref() == Some(key) && j.created_at >= since)
            .await)
    }

    async fn find_recent_by_hash(
        &self,
        hash: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let since = window_start(ttl);
        Ok(self
            .most_recent(|j| {
                j.hash == hash && j.status != JobStatus::Cancelled && j.created_at >= since
            })
            .await)
    }

    async fn find_queued_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.oldest_first(|j| j.is_due(now)).await)
    }

    async fn find_running_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.oldest_first(|j| j.lease_expired(now)).await)
    }

    async fn requeue(
        &self,
        id: JobId,
        attempts: u32,
        available_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.mutate(id, |job| {
            let from = job.status;
            job.requeue(attempts, time::truncate(available_at), time::now())
                .map_err(|_| JobStoreError::InvalidTransition {
                    id,
                    from,
                    to: JobStatus::Queued,
                })
        })
        .await?;
        warn!(job_id = %id, attempts, %available_at, "job requeued");
        Ok(())
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let doomed: Vec<JobId> = jobs
            .values()
            .filter(|j| j.created_at < cutoff)
            .map(|j| j.id)
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        let mut deleted: Vec<JobRecord> = doomed.iter().filter_map(|id| jobs.remove(id)).collect();
        if let Err(e) = self.persist(&jobs).await {
            for job in deleted {
                jobs.insert(job.id, job);
            }
            return Err(e);
        }

        deleted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        info!(%cutoff, count = deleted.len(), "old jobs deleted");
        Ok(deleted)
    }
}

fn storage(action: &str, path: &Path, err: std::io::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to {action} {}: {err}", path.display()))
}
