//! Job persistence port.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use docflow_core::{JobId, JobPage, JobPaths, JobQuery, JobRecord, JobStatus, StatusUpdate};

use crate::config::{DatabaseConfig, StoreProvider};

use super::document::DocumentJobStore;
use super::sqlite::SqliteJobStore;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence contract shared by every backend.
///
/// Each call is atomic on its own. Nothing here spans calls: flows such as
/// "load, then issue several updates" are not transactional and rely on the
/// rescheduler to recover from a crash between steps.
///
/// Status-changing calls reject moves the job state machine forbids with
/// [`JobStoreError::InvalidTransition`]; terminal records stay terminal.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Filtered listing, newest first. `page`/`page_size` are clamped
    /// (page ≥ 1, size 1..=100, 0 means 20).
    async fn list_paged_filtered(
        &self,
        page: u32,
        page_size: u32,
        query: &JobQuery,
    ) -> Result<JobPage, JobStoreError>;

    async fn list_paged(&self, page: u32, page_size: u32) -> Result<JobPage, JobStoreError> {
        self.list_paged_filtered(page, page_size, &JobQuery::default())
            .await
    }

    /// Insert a new record. `created_at` and `updated_at` are set to now;
    /// the stored record is returned.
    async fn create(&self, record: JobRecord) -> Result<JobRecord, JobStoreError>;

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<(), JobStoreError>;

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobStoreError>;

    /// Returns the new attempt count.
    async fn increment_attempts(&self, id: JobId) -> Result<u32, JobStoreError>;

    async fn touch_lease(&self, id: JobId, lease_until: DateTime<Utc>)
    -> Result<(), JobStoreError>;

    async fn update_paths(&self, id: JobId, paths: JobPaths) -> Result<(), JobStoreError>;

    /// Records in `Queued` or `Running`.
    async fn count_pending(&self) -> Result<u64, JobStoreError>;

    async fn mark_failed(&self, id: JobId, message: &str) -> Result<(), JobStoreError> {
        let update = StatusUpdate::new(JobStatus::Failed)
            .with_error(message)
            .ended(docflow_core::time::now());
        self.update_status(id, update).await
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        ended_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<(), JobStoreError> {
        let update = StatusUpdate::new(JobStatus::Succeeded)
            .ended(ended_at)
            .duration_ms(duration_ms);
        self.update_status(id, update).await
    }

    async fn mark_cancelled(&self, id: JobId, message: &str) -> Result<(), JobStoreError> {
        let update = StatusUpdate::new(JobStatus::Cancelled)
            .with_error(message)
            .ended(docflow_core::time::now());
        self.update_status(id, update).await
    }

    /// Most recent record with this key created within `ttl`.
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError>;

    /// Most recent non-cancelled record with this content hash created within `ttl`.
    async fn find_recent_by_hash(
        &self,
        hash: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError>;

    /// Queued records with no `available_at` or one at or before `now`,
    /// oldest first.
    async fn find_queued_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Running records whose lease is set and at or before `now`.
    async fn find_running_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Back to Queued with the given attempt count and availability; the
    /// lease is cleared.
    async fn requeue(
        &self,
        id: JobId,
        attempts: u32,
        available_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Delete and return every record created before `cutoff`.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;
}

/// Build the configured adapter.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn JobStore>, JobStoreError> {
    let store: Arc<dyn JobStore> = match config.provider {
        StoreProvider::Sqlite => Arc::new(SqliteJobStore::connect(&config.url).await?),
        StoreProvider::Document => Arc::new(DocumentJobStore::open(&config.url).await?),
    };
    tracing::info!(provider = ?config.provider, url = %config.url, "job store opened");
    Ok(store)
}

/// Earliest `created_at` still inside a lookback window ending now.
pub(crate) fn window_start(ttl: Duration) -> DateTime<Utc> {
    docflow_core::time::now()
        .checked_sub_signed(docflow_core::time::delta(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
