//! SQLite-backed job store.
//!
//! All timestamps are stored as INTEGER epoch milliseconds so range predicates
//! (`available_at <= ?`, `lease_until <= ?`, `created_at < ?`) compare
//! numerically. Artifact paths are kept as one JSON document in `paths`, with
//! the input path duplicated into `input_path` for text search.
//!
//! ## Error Mapping
//!
//! | SQLx error | JobStoreError |
//! |------------|---------------|
//! | unique violation on insert | `AlreadyExists` |
//! | undecodable row | `Corrupt` |
//! | anything else | `Storage` |

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, instrument, warn};

use docflow_core::{
    DocumentRef, JobId, JobMetrics, JobPage, JobPaths, JobQuery, JobRecord, JobStatus,
    StatusUpdate, clamp_page, time,
};

use super::store::{JobStore, JobStoreError, window_start};

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        status           TEXT NOT NULL,
        progress         INTEGER NOT NULL DEFAULT 0,
        attempts         INTEGER NOT NULL DEFAULT 0,
        priority         INTEGER NOT NULL DEFAULT 0,
        available_at     INTEGER NULL,
        lease_until      INTEGER NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        started_at       INTEGER NULL,
        ended_at         INTEGER NULL,
        duration_ms      INTEGER NULL,
        idempotency_key  TEXT NULL,
        hash             TEXT NOT NULL DEFAULT '',
        input_path       TEXT NULL,
        paths            TEXT NOT NULL,
        error_message    TEXT NULL,
        model            TEXT NOT NULL DEFAULT '',
        template_token   TEXT NOT NULL DEFAULT '',
        immediate        INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_jobs_created_at ON jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS ix_jobs_status_available ON jobs (status, available_at)",
    "CREATE INDEX IF NOT EXISTS ix_jobs_idempotency_key ON jobs (idempotency_key)",
    "CREATE INDEX IF NOT EXISTS ix_jobs_hash ON jobs (hash)",
];

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, status, progress, attempts, priority, available_at, lease_until, \
    created_at, updated_at, started_at, ended_at, duration_ms, idempotency_key, hash, \
    paths, error_message, model, template_token, immediate";

/// SQLite job store. Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Connect to `url` (e.g. `sqlite://./data/jobs.db`), creating the file
    /// and schema when missing. The database runs in WAL mode so readers
    /// never block the single writer, and writers queue on `BUSY_TIMEOUT`.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    JobStoreError::Storage(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database, used by tests. A single connection that
    /// never idles out, otherwise the database would vanish with it.
    pub async fn in_memory() -> Result<Self, JobStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(Self { pool })
    }

    async fn fetch_one_where(
        &self,
        operation: &str,
        qb: &mut QueryBuilder<'_, Sqlite>,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    async fn fetch_all_where(
        &self,
        operation: &str,
        qb: &mut QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_row).collect()
    }

    /// Run a single-column UPDATE and turn "no row touched" into `NotFound`.
    async fn update_one(
        &self,
        operation: &str,
        id: JobId,
        qb: &mut QueryBuilder<'_, Sqlite>,
    ) -> Result<(), JobStoreError> {
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    /// Run a status-guarded UPDATE as one statement. When it matches no row,
    /// the current status tells a missing job apart from a refused move.
    async fn transition(
        &self,
        operation: &str,
        id: JobId,
        next: JobStatus,
        qb: &mut QueryBuilder<'_, Sqlite>,
    ) -> Result<(), JobStoreError> {
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        let Some(raw) = current else {
            return Err(JobStoreError::NotFound(id));
        };
        let from = JobStatus::from_str(&raw)
            .map_err(|e| JobStoreError::Corrupt(format!("status of {id}: {e}")))?;
        Err(JobStoreError::InvalidTransition { id, from, to: next })
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let mut qb = select();
        qb.push(" WHERE id = ").push_bind(id.to_string());
        self.fetch_one_where("get", &mut qb).await
    }

    #[instrument(skip(self, query), err)]
    async fn list_paged_filtered(
        &self,
        page: u32,
        page_size: u32,
        query: &JobQuery,
    ) -> Result<JobPage, JobStoreError> {
        let (page, page_size) = clamp_page(page, page_size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs");
        push_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_paged_filtered", e))?;

        let mut qb = select();
        push_filters(&mut qb, query);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(JobPage::offset(page, page_size) as i64);
        let items = self.fetch_all_where("list_paged_filtered", &mut qb).await?;

        Ok(JobPage {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    async fn create(&self, mut record: JobRecord) -> Result<JobRecord, JobStoreError> {
        let now = time::now();
        record.created_at = now;
        record.updated_at = now;
        let paths = encode_paths(&record.paths)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, progress, attempts, priority, available_at, lease_until,
                created_at, updated_at, started_at, ended_at, duration_ms,
                idempotency_key, hash, input_path, paths, error_message,
                model, template_token, immediate
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(i64::from(record.progress))
        .bind(i64::from(record.attempts))
        .bind(i64::from(record.priority))
        .bind(record.available_at.map(millis))
        .bind(record.lease_until.map(millis))
        .bind(millis(record.created_at))
        .bind(millis(record.updated_at))
        .bind(record.metrics.started_at.map(millis))
        .bind(record.metrics.ended_at.map(millis))
        .bind(record.metrics.duration_ms.map(|d| d as i64))
        .bind(record.idempotency_key.as_deref())
        .bind(record.hash.as_str())
        .bind(input_path_text(&record.paths))
        .bind(paths)
        .bind(record.error_message.as_deref())
        .bind(record.model.as_str())
        .bind(record.template_token.as_str())
        .bind(record.immediate)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobStoreError::AlreadyExists(record.id)
            }
            other => map_sqlx_error("create", other),
        })?;

        // Round-trip through the stored precision so the returned value
        // equals a later `get`.
        record.available_at = record.available_at.map(time::truncate);
        record.lease_until = record.lease_until.map(time::truncate);
        record.metrics.started_at = record.metrics.started_at.map(time::truncate);
        record.metrics.ended_at = record.metrics.ended_at.map(time::truncate);

        info!(job_id = %record.id, status = %record.status, "job created");
        Ok(record)
    }

    #[instrument(skip(self, update), fields(job_id = %id, status = %update.status), err)]
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<(), JobStoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET status = ");
        qb.push_bind(update.status.as_str())
            .push(", error_message = ")
            .push_bind(update.error_message.clone())
            .push(", started_at = COALESCE(")
            .push_bind(update.started_at.map(millis))
            .push(", started_at), ended_at = COALESCE(")
            .push_bind(update.ended_at.map(millis))
            .push(", ended_at), duration_ms = COALESCE(")
            .push_bind(update.duration_ms.map(|d| d as i64))
            .push(", duration_ms), updated_at = ")
            .push_bind(millis(time::now()))
            .push(" WHERE id = ")
            .push_bind(id.to_string());
        push_source_guard(&mut qb, update.status);
        self.transition("update_status", id, update.status, &mut qb).await?;

        match update.status {
            JobStatus::Failed | JobStatus::Cancelled => warn!(
                job_id = %id,
                to = %update.status,
                error = update.error_message.as_deref().unwrap_or(""),
                "job status updated"
            ),
            _ => debug!(job_id = %id, to = %update.status, "job status updated"),
        }
        Ok(())
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobStoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET progress = ");
        qb.push_bind(i64::from(progress.min(100)))
            .push(", updated_at = ")
            .push_bind(millis(time::now()))
            .push(" WHERE id = ")
            .push_bind(id.to_string());
        self.update_one("update_progress", id, &mut qb).await?;
        debug!(job_id = %id, progress, "job progress updated");
        Ok(())
    }

    async fn increment_attempts(&self, id: JobId) -> Result<u32, JobStoreError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE jobs SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2 RETURNING attempts",
        )
        .bind(millis(time::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_attempts", e))?;

        let attempts = attempts.ok_or(JobStoreError::NotFound(id))?;
        debug!(job_id = %id, attempts, "job attempts incremented");
        Ok(attempts.max(0) as u32)
    }

    async fn touch_lease(
        &self,
        id: JobId,
        lease_until: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET lease_until = ");
        qb.push_bind(millis(lease_until))
            .push(", updated_at = ")
            .push_bind(millis(time::now()))
            .push(" WHERE id = ")
            .push_bind(id.to_string());
        self.update_one("touch_lease", id, &mut qb).await?;
        debug!(job_id = %id, %lease_until, "job lease touched");
        Ok(())
    }

    async fn update_paths(&self, id: JobId, paths: JobPaths) -> Result<(), JobStoreError> {
        let encoded = encode_paths(&paths)?;
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET paths = ");
        qb.push_bind(encoded)
            .push(", input_path = ")
            .push_bind(input_path_text(&paths))
            .push(", updated_at = ")
            .push_bind(millis(time::now()))
            .push(" WHERE id = ")
            .push_bind(id.to_string());
        self.update_one("update_paths", id, &mut qb).await
    }

    async fn count_pending(&self) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('Queued', 'Running')")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_pending", e))?;
        Ok(count.max(0) as u64)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let mut qb = select();
        qb.push(" WHERE idempotency_key = ")
            .push_bind(key.to_string())
            .push(" AND created_at >= ")
            .push_bind(millis(window_start(ttl)))
            .push(" ORDER BY created_at DESC LIMIT 1");
        self.fetch_one_where("find_by_idempotency_key", &mut qb).await
    }

    async fn find_recent_by_hash(
        &self,
        hash: &str,
        ttl: Duration,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let mut qb = select();
        qb.push(" WHERE hash = ")
            .push_bind(hash.to_string())
            .push(" AND status <> 'Cancelled' AND created_at >= ")
            .push_bind(millis(window_start(ttl)))
            .push(" ORDER BY created_at DESC LIMIT 1");
        self.fetch_one_where("find_recent_by_hash", &mut qb).await
    }

    async fn find_queued_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut qb = select();
        qb.push(" WHERE status = 'Queued' AND (available_at IS NULL OR available_at <= ")
            .push_bind(millis(now))
            .push(") ORDER BY created_at ASC, id ASC");
        self.fetch_all_where("find_queued_due", &mut qb).await
    }

    async fn find_running_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut qb = select();
        qb.push(" WHERE status = 'Running' AND lease_until IS NOT NULL AND lease_until <= ")
            .push_bind(millis(now))
            .push(" ORDER BY created_at ASC, id ASC");
        self.fetch_all_where("find_running_expired", &mut qb).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue(
        &self,
        id: JobId,
        attempts: u32,
        available_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE jobs SET status = 'Queued', lease_until = NULL, attempts = MAX(attempts, ",
        );
        qb.push_bind(i64::from(attempts))
            .push("), available_at = ")
            .push_bind(millis(available_at))
            .push(", updated_at = ")
            .push_bind(millis(time::now()))
            .push(" WHERE id = ")
            .push_bind(id.to_string());
        push_source_guard(&mut qb, JobStatus::Queued);
        self.transition("requeue", id, JobStatus::Queued, &mut qb).await?;

        warn!(job_id = %id, attempts, %available_at, "job requeued");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "DELETE FROM jobs WHERE created_at < ?1 RETURNING {COLUMNS}"
        ))
        .bind(millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        // The rows are gone either way; an undecodable one only loses its
        // artifact directory cleanup.
        let mut deleted = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_row(row) {
                Ok(job) => deleted.push(job),
                Err(e) => warn!(error = %e, "deleted an undecodable job row"),
            }
        }
        deleted.sort_by_key(|job| job.created_at);

        info!(%cutoff, count = rows.len(), "old jobs deleted");
        Ok(deleted)
    }
}

fn select() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(format!("SELECT {COLUMNS} FROM jobs"))
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &JobQuery) {
    let mut sep = " WHERE ";
    let mut next = |qb: &mut QueryBuilder<'_, Sqlite>| {
        qb.push(sep);
        sep = " AND ";
    };

    if let Some(needle) = query.needle() {
        let pattern = format!("%{}%", escape_like(&needle));
        next(qb);
        qb.push("(lower(id) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR replace(lower(id), '-', '') LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR lower(COALESCE(input_path, '')) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if !query.statuses.is_empty() {
        next(qb);
        qb.push("status IN (");
        let mut list = qb.separated(", ");
        for status in &query.statuses {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(")");
    }
    if let Some(from) = query.from {
        next(qb);
        qb.push("created_at >= ").push_bind(millis(from));
    }
    if let Some(to) = query.to {
        next(qb);
        qb.push("created_at <= ").push_bind(millis(to));
    }
    if let Some(immediate) = query.immediate {
        next(qb);
        qb.push("immediate = ").push_bind(immediate);
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Append `AND status IN (...)` listing every state allowed to move to `next`.
fn push_source_guard(qb: &mut QueryBuilder<'_, Sqlite>, next: JobStatus) {
    qb.push(" AND status IN (");
    let mut list = qb.separated(", ");
    for from in JobStatus::ALL.into_iter().filter(|s| s.can_transition_to(next)) {
        list.push_bind(from.as_str());
    }
    list.push_unseparated(")");
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Corrupt(format!("{column} out of range: {ms}")))
}

fn opt_from_millis(column: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    ms.map(|ms| from_millis(column, ms)).transpose()
}

fn encode_paths(paths: &JobPaths) -> Result<String, JobStoreError> {
    serde_json::to_string(paths)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode paths: {e}")))
}

fn input_path_text(paths: &JobPaths) -> Option<String> {
    paths
        .input
        .as_ref()
        .map(|d: &DocumentRef| d.path.to_string_lossy().into_owned())
}

/// Raw `jobs` row, decoded field by field before domain validation.
struct JobRow {
    id: String,
    status: String,
    progress: i64,
    attempts: i64,
    priority: i64,
    available_at: Option<i64>,
    lease_until: Option<i64>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    duration_ms: Option<i64>,
    idempotency_key: Option<String>,
    hash: String,
    paths: String,
    error_message: Option<String>,
    model: String,
    template_token: String,
    immediate: bool,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            attempts: row.try_get("attempts")?,
            priority: row.try_get("priority")?,
            available_at: row.try_get("available_at")?,
            lease_until: row.try_get("lease_until")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_ms: row.try_get("duration_ms")?,
            idempotency_key: row.try_get("idempotency_key")?,
            hash: row.try_get("hash")?,
            paths: row.try_get("paths")?,
            error_message: row.try_get("error_message")?,
            model: row.try_get("model")?,
            template_token: row.try_get("template_token")?,
            immediate: row.try_get("immediate")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: docflow_core::DomainError| JobStoreError::Corrupt(e.to_string());
        let paths: JobPaths = serde_json::from_str(&row.paths)
            .map_err(|e| JobStoreError::Corrupt(format!("paths of {}: {e}", row.id)))?;

        Ok(JobRecord {
            id: row.id.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            progress: row.progress.clamp(0, 100) as u8,
            attempts: row.attempts.clamp(0, i64::from(u32::MAX)) as u32,
            priority: row.priority.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            available_at: opt_from_millis("available_at", row.available_at)?,
            lease_until: opt_from_millis("lease_until", row.lease_until)?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            metrics: JobMetrics {
                started_at: opt_from_millis("started_at", row.started_at)?,
                ended_at: opt_from_millis("ended_at", row.ended_at)?,
                duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
            },
            idempotency_key: row.idempotency_key,
            hash: row.hash,
            paths,
            error_message: row.error_message,
            model: row.model,
            template_token: row.template_token,
            immediate: row.immediate,
        })
    }
}

fn decode_row(row: &SqliteRow) -> Result<JobRecord, JobStoreError> {
    use sqlx::FromRow;
    let raw = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to decode job row: {e}")))?;
    JobRecord::try_from(raw)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("{} in {}", err, operation))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}
