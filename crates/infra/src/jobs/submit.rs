//! Submission path: validation, backpressure, dedupe, then a new Queued job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docflow_core::{DocumentRef, JobId, JobPaths, JobRecord, JobStatus, time};

use crate::config::JobQueueConfig;

use super::artifacts::{ArtifactError, ArtifactStore};
use super::dispatch::WorkDispatcher;
use super::runner::{JobRunner, RunOptions};
use super::store::{JobStore, JobStoreError};

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["pdf", "png", "jpg", "jpeg"];
pub const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 60;
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unsupported file type: {0:?}")]
    UnsupportedFileType(String),
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("queue is full, retry after {retry_after_secs}s")]
    QueueFull { retry_after_secs: u64 },
    #[error("immediate execution is disabled")]
    ImmediateDisabled,
    #[error("no execution slot available")]
    Busy,
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is already {status}")]
    Conflict { id: JobId, status: JobStatus },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// An uploaded document plus the processing parameters.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub model: String,
    pub template_token: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Created,
    /// Returned the job submitted earlier with the same idempotency key.
    IdempotencyHit,
    /// Returned a recent job with identical input bytes.
    HashHit,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobRecord,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
pub struct ImmediateSubmission {
    /// Record state after the inline run (or at enqueue time).
    pub job: JobRecord,
    pub disposition: Disposition,
    /// False when the job fell back to the queue.
    pub ran_inline: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitConfig {
    pub max_upload_bytes: u64,
    pub max_queue_length: u64,
    pub dedupe_window: Duration,
    pub immediate_enabled: bool,
    pub immediate_timeout: Duration,
    pub fallback_to_queue: bool,
}

impl From<&JobQueueConfig> for SubmitConfig {
    fn from(config: &JobQueueConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes(),
            max_queue_length: config.queue.max_queue_length,
            dedupe_window: config.dedupe_window(),
            immediate_enabled: config.immediate.enabled,
            immediate_timeout: config.immediate_timeout(),
            fallback_to_queue: config.immediate.fallback_to_queue,
        }
    }
}

enum Prepared {
    Existing(Submission),
    New { hash: String, ext: String },
}

pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    artifacts: ArtifactStore,
    dispatcher: Arc<dyn WorkDispatcher>,
    runner: Arc<JobRunner>,
    config: SubmitConfig,
    shutdown: CancellationToken,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: ArtifactStore,
        dispatcher: Arc<dyn WorkDispatcher>,
        runner: Arc<JobRunner>,
        config: SubmitConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            artifacts,
            dispatcher,
            runner,
            config,
            shutdown,
        }
    }

    /// Accept a document for background processing.
    pub async fn submit(&self, new_job: NewJob) -> Result<Submission, SubmitError> {
        let (hash, ext) = match self.prepare(&new_job).await? {
            Prepared::Existing(found) => return Ok(found),
            Prepared::New { hash, ext } => (hash, ext),
        };

        let job = self.persist(&new_job, hash, &ext, false).await?;
        self.enqueue(job.id);
        Ok(Submission {
            job,
            disposition: Disposition::Created,
        })
    }

    /// Run the document inline when a gate slot is free right now;
    /// otherwise queue it (or refuse, when fallback is off).
    pub async fn submit_immediate(
        &self,
        new_job: NewJob,
    ) -> Result<ImmediateSubmission, SubmitError> {
        if !self.config.immediate_enabled {
            return Err(SubmitError::ImmediateDisabled);
        }

        let (hash, ext) = match self.prepare(&new_job).await? {
            Prepared::Existing(found) => {
                return Ok(ImmediateSubmission {
                    job: found.job,
                    disposition: found.disposition,
                    ran_inline: false,
                });
            }
            Prepared::New { hash, ext } => (hash, ext),
        };

        let Some(permit) = self.runner.gate().try_enter() else {
            if !self.config.fallback_to_queue {
                warn!("no slot for immediate job, rejecting");
                return Err(SubmitError::Busy);
            }
            info!("no slot for immediate job, falling back to queue");
            let job = self.persist(&new_job, hash, &ext, false).await?;
            self.enqueue(job.id);
            return Ok(ImmediateSubmission {
                job,
                disposition: Disposition::Created,
                ran_inline: false,
            });
        };

        let job = self.persist(&new_job, hash, &ext, true).await?;
        let options = RunOptions::default()
            .with_permit(permit)
            .with_timeout(self.config.immediate_timeout);
        if let Err(e) = self.runner.run(job.id, self.shutdown.clone(), options).await {
            info!(job_id = %job.id, error = %e, "immediate job did not succeed");
        }

        let job = self
            .store
            .get(job.id)
            .await?
            .ok_or(SubmitError::NotFound(job.id))?;
        Ok(ImmediateSubmission {
            job,
            disposition: Disposition::Created,
            ran_inline: true,
        })
    }

    async fn prepare(&self, new_job: &NewJob) -> Result<Prepared, SubmitError> {
        if new_job.bytes.is_empty() {
            return Err(SubmitError::Validation("file is empty".to_string()));
        }
        if new_job.model.trim().is_empty() || new_job.template_token.trim().is_empty() {
            return Err(SubmitError::Validation(
                "model and template token are required".to_string(),
            ));
        }

        let size = new_job.bytes.len() as u64;
        if size > self.config.max_upload_bytes {
            warn!(bytes = size, limit = self.config.max_upload_bytes, "payload too large");
            return Err(SubmitError::PayloadTooLarge {
                size,
                limit: self.config.max_upload_bytes,
            });
        }

        let ext = extension_of(&new_job.file_name)?;

        let pending = self.store.count_pending().await?;
        if pending >= self.config.max_queue_length {
            warn!(pending, max = self.config.max_queue_length, "backpressure triggered");
            return Err(SubmitError::QueueFull {
                retry_after_secs: QUEUE_FULL_RETRY_AFTER_SECS,
            });
        }

        if let Some(key) = new_job.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(job) = self
                .store
                .find_by_idempotency_key(key, self.config.dedupe_window)
                .await?
            {
                info!(job_id = %job.id, "idempotency hit");
                return Ok(Prepared::Existing(Submission {
                    job,
                    disposition: Disposition::IdempotencyHit,
                }));
            }
        }

        let hash = content_hash(&new_job.bytes);
        if let Some(job) = self
            .store
            .find_recent_by_hash(&hash, self.config.dedupe_window)
            .await?
        {
            info!(job_id = %job.id, "hash dedupe hit");
            return Ok(Prepared::Existing(Submission {
                job,
                disposition: Disposition::HashHit,
            }));
        }

        Ok(Prepared::New { hash, ext })
    }

    /// Create the job directory and record. A submission that fails part way
    /// leaves nothing behind: its directory is removed before the error
    /// is returned.
    async fn persist(
        &self,
        new_job: &NewJob,
        hash: String,
        ext: &str,
        immediate: bool,
    ) -> Result<JobRecord, SubmitError> {
        let id = JobId::new();
        let dir = self.artifacts.create_job_directory(id).await?;
        match self.persist_in(id, &dir, new_job, hash, ext, immediate).await {
            Ok(job) => {
                info!(job_id = %job.id, immediate, "job submitted");
                Ok(job)
            }
            Err(e) => {
                if let Err(cleanup) = self.artifacts.remove_dir(&dir).await {
                    warn!(job_id = %id, error = %cleanup, "failed to remove abandoned job directory");
                }
                Err(e)
            }
        }
    }

    async fn persist_in(
        &self,
        id: JobId,
        dir: &Path,
        new_job: &NewJob,
        hash: String,
        ext: &str,
        immediate: bool,
    ) -> Result<JobRecord, SubmitError> {
        let input_name = format!("input.{ext}");
        self.artifacts
            .save_input_atomic(id, &input_name, &new_job.bytes)
            .await?;
        let input_at = time::now();

        let prompt = format!(
            "template: {}\nmodel: {}\n",
            new_job.template_token, new_job.model
        );
        self.artifacts
            .save_text_atomic(id, JobPaths::PROMPT_FILE, &prompt)
            .await?;
        let prompt_at = time::now();

        let manifest = serde_json::json!({
            "job_id": id,
            "file_name": new_job.file_name,
            "ext": ext,
            "hash": hash,
            "created_at": input_at,
            "model": new_job.model,
            "template_token": new_job.template_token,
        });
        self.artifacts
            .save_text_atomic(id, MANIFEST_FILE, &manifest.to_string())
            .await?;

        let mut paths = JobPaths::in_dir(dir, &input_name);
        paths.input = paths.input.take().map(|d: DocumentRef| d.created(input_at));
        paths.prompt = paths.prompt.take().map(|d: DocumentRef| d.created(prompt_at));

        let mut record = JobRecord::queued(id)
            .with_paths(paths)
            .with_hash(hash)
            .with_model(new_job.model.clone(), new_job.template_token.clone())
            .immediate(immediate);
        if let Some(key) = new_job.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            record = record.with_idempotency_key(key);
        }

        Ok(self.store.create(record).await?)
    }

    /// A failed enqueue is not fatal: the record is Queued and the
    /// rescheduler picks it up on its next tick.
    fn enqueue(&self, id: JobId) {
        if let Err(e) = self.dispatcher.enqueue(id) {
            warn!(job_id = %id, error = %e, "enqueue failed, left for the rescheduler");
        }
    }
}

/// Lower-case hex SHA-256 of the input bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn extension_of(file_name: &str) -> Result<String, SubmitError> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        warn!(file_ext = %ext, "unsupported file type");
        Err(SubmitError::UnsupportedFileType(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn extensions_are_case_insensitive() {
        assert_eq!(extension_of("Scan.PDF").unwrap(), "pdf");
        assert_eq!(extension_of("photo.jpeg").unwrap(), "jpeg");
        assert!(matches!(
            extension_of("notes.txt"),
            Err(SubmitError::UnsupportedFileType(_))
        ));
        assert!(extension_of("no_extension").is_err());
    }
}
