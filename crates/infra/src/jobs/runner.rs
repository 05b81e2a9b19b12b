//! Executes one job end to end.
//!
//! A run walks through: gate slot, deadline, load, start sequence, processing
//! (with a lease heartbeat) and exactly one terminal outcome. Every terminal
//! outcome writes its artifact before the status, so a reader that sees the
//! status can always find the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use docflow_core::{DocumentRef, JobId, JobPaths, JobRecord, JobStatus, StatusUpdate, time};

use crate::config::JobQueueConfig;

use super::artifacts::ArtifactStore;
use super::deadline::{CancelReason, JobDeadline};
use super::gate::{ConcurrencyGate, GateError, GatePermit};
use super::processing::{ProcessInput, ProcessOutcome, ProcessResult, Processor};
use super::store::{JobStore, JobStoreError};

pub const CANCELLED_BY_USER: &str = "cancelled by user";
pub const TIMEOUT: &str = "timeout";

#[derive(Debug, thiserror::Error)]
pub enum JobRunError {
    #[error("job cancelled ({0})")]
    Cancelled(CancelReason),
    #[error("job timed out")]
    TimedOut,
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("processing reported failure: {0}")]
    Rejected(String),
    #[error("{0}")]
    OutputNotWritten(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// No record with that id.
    Missing,
    /// The record was not Queued when loaded.
    Skipped { status: JobStatus },
    /// Someone else finalised the record while it ran.
    Superseded,
}

/// Per-call overrides.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Slot reserved by the caller; the runner then skips the gate.
    pub permit: Option<GatePermit>,
    /// Replaces the configured job timeout.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_permit(mut self, permit: GatePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub job_timeout: Duration,
    pub lease_window: Duration,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
}

impl From<&JobQueueConfig> for RunnerConfig {
    fn from(config: &JobQueueConfig) -> Self {
        Self {
            job_timeout: config.job_timeout(),
            lease_window: config.lease_window(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

enum Settled {
    Interrupted(CancelReason),
    Finished(Result<ProcessResult, String>),
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    artifacts: ArtifactStore,
    processor: Arc<dyn Processor>,
    gate: ConcurrencyGate,
    config: RunnerConfig,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: ArtifactStore,
        processor: Arc<dyn Processor>,
        gate: ConcurrencyGate,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            processor,
            gate,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Signal the in-flight run of `id`, if any. Returns whether one was running.
    pub fn cancel(&self, id: JobId) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Run job `id` to a terminal state.
    ///
    /// `Err` means the job did not succeed; the outcome has already been
    /// persisted (status plus error artifact) when the error is returned.
    #[instrument(name = "job_run", skip(self, shutdown, options), fields(job_id = %id))]
    pub async fn run(
        &self,
        id: JobId,
        shutdown: CancellationToken,
        options: RunOptions,
    ) -> Result<RunOutcome, JobRunError> {
        let started = Instant::now();
        let result = self.run_inner(id, shutdown, options).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => info!(elapsed_ms, outcome = ?outcome, "job finalized"),
            Err(e) => warn!(elapsed_ms, error = %e, "job finalized"),
        }
        result
    }

    async fn run_inner(
        &self,
        id: JobId,
        shutdown: CancellationToken,
        options: RunOptions,
    ) -> Result<RunOutcome, JobRunError> {
        let _permit = match options.permit {
            Some(permit) => permit,
            None => self.gate.wait(&shutdown).await.map_err(|e| match e {
                GateError::Cancelled => JobRunError::Cancelled(CancelReason::Shutdown),
                other => JobRunError::Gate(other),
            })?,
        };

        let user = CancellationToken::new();
        let _registration = Registration::new(&self.running, id, user.clone());
        let timeout = options.timeout.unwrap_or(self.config.job_timeout);
        let deadline = JobDeadline::new(shutdown, user, timeout);

        let Some(record) = self.store.get(id).await? else {
            warn!("job not found, skipping");
            return Ok(RunOutcome::Missing);
        };
        if record.status != JobStatus::Queued {
            info!(status = %record.status, "job not queued, skipping");
            return Ok(RunOutcome::Skipped {
                status: record.status,
            });
        }

        let started_at = time::now();
        match self.start(&record, started_at).await {
            Ok(()) => {}
            Err(JobStoreError::NotFound(_)) => return Ok(RunOutcome::Missing),
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                info!(status = %from, "job finalised before it started");
                return Ok(RunOutcome::Superseded);
            }
            Err(e) => return Err(e.into()),
        }

        let input = self.process_input(&record);
        match self.execute(id, input, &deadline).await {
            Settled::Interrupted(reason) => self.interrupted(&record, reason).await,
            Settled::Finished(Err(message)) => match deadline.reason() {
                Some(reason) => self.interrupted(&record, reason).await,
                None => {
                    self.write_error(&record, &message).await;
                    if !self.finalize(self.store.mark_failed(id, &message).await)? {
                        return Ok(RunOutcome::Superseded);
                    }
                    Err(JobRunError::ProcessingFailed(message))
                }
            },
            Settled::Finished(Ok(result)) => self.completed(&record, started_at, result).await,
        }
    }

    /// Start sequence; the lease goes in before the status so a Running
    /// record always carries one.
    async fn start(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let attempt = self.store.increment_attempts(record.id).await?;
        self.store
            .touch_lease(record.id, now + time::delta(self.config.lease_window))
            .await?;
        self.store
            .update_status(record.id, StatusUpdate::new(JobStatus::Running).started(now))
            .await?;
        self.store.update_progress(record.id, 0).await?;
        info!(attempt, "job started");
        Ok(())
    }

    async fn execute(&self, id: JobId, input: ProcessInput, deadline: &JobDeadline) -> Settled {
        let processor = Arc::clone(&self.processor);
        let token = deadline.token();
        let mut task = tokio::spawn(async move { processor.execute(input, token).await });

        let heartbeat_enabled = !self.config.heartbeat_interval.is_zero();
        let period = if heartbeat_enabled {
            self.config.heartbeat_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                reason = deadline.fired() => {
                    task.abort();
                    return Settled::Interrupted(reason);
                }
                joined = &mut task => {
                    return Settled::Finished(flatten(joined));
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let lease_until = time::now() + time::delta(self.config.lease_window);
                    match self.store.touch_lease(id, lease_until).await {
                        Ok(()) => debug!(%lease_until, "lease extended"),
                        Err(e) => warn!(error = %e, "failed to extend lease"),
                    }
                }
            }
        }
    }

    async fn interrupted(
        &self,
        record: &JobRecord,
        reason: CancelReason,
    ) -> Result<RunOutcome, JobRunError> {
        let (applied, err) = match reason {
            CancelReason::Timeout => {
                self.write_error(record, TIMEOUT).await;
                let applied = self.finalize(self.store.mark_failed(record.id, TIMEOUT).await)?;
                (applied, JobRunError::TimedOut)
            }
            CancelReason::Shutdown | CancelReason::User => {
                self.write_error(record, CANCELLED_BY_USER).await;
                let applied = self
                    .finalize(self.store.mark_cancelled(record.id, CANCELLED_BY_USER).await)?;
                (applied, JobRunError::Cancelled(reason))
            }
        };
        if applied { Err(err) } else { Ok(RunOutcome::Superseded) }
    }

    async fn completed(
        &self,
        record: &JobRecord,
        started_at: DateTime<Utc>,
        result: ProcessResult,
    ) -> Result<RunOutcome, JobRunError> {
        let id = record.id;
        match result.outcome {
            ProcessOutcome::Failure { error_message } => {
                self.write_error(record, &error_message).await;
                if !self.finalize(self.store.mark_failed(id, &error_message).await)? {
                    return Ok(RunOutcome::Superseded);
                }
                Err(JobRunError::Rejected(error_message))
            }
            ProcessOutcome::Success { output_json } => {
                // A job without its output is not a success.
                let output_path = match self
                    .artifacts
                    .save_text_atomic(id, record.paths.output_file_name(), &output_json)
                    .await
                {
                    Ok(path) => path,
                    Err(e) => {
                        let message = format!("failed to write output: {e}");
                        self.write_error(record, &message).await;
                        if !self.finalize(self.store.mark_failed(id, &message).await)? {
                            return Ok(RunOutcome::Superseded);
                        }
                        return Err(JobRunError::OutputNotWritten(message));
                    }
                };
                let written_at = time::now();

                let ended_at = time::now();
                let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
                if !self.finalize(self.store.mark_succeeded(id, ended_at, duration_ms).await)? {
                    return Ok(RunOutcome::Superseded);
                }
                self.store.update_progress(id, 100).await?;

                let mut paths = record.paths.clone();
                paths.output = Some(
                    DocumentRef::new(output_path)
                        .created(result.artifacts.output_created_at.unwrap_or(written_at)),
                );
                if let Some(at) = result.artifacts.markdown_created_at {
                    let markdown = paths
                        .markdown
                        .take()
                        .unwrap_or_else(|| DocumentRef::new(self.job_dir(record).join(JobPaths::MARKDOWN_FILE)));
                    paths.markdown = Some(markdown.created(at));
                }
                if let Err(e) = self.store.update_paths(id, paths).await {
                    warn!(error = %e, "failed to record artifact paths");
                }

                info!(duration_ms, "job succeeded");
                Ok(RunOutcome::Succeeded)
            }
        }
    }

    /// Turn a terminal mutation into "applied or not". A record finalised
    /// by someone else is not an error for this run.
    fn finalize(&self, result: Result<(), JobStoreError>) -> Result<bool, JobRunError> {
        match result {
            Ok(()) => Ok(true),
            Err(JobStoreError::InvalidTransition { from, to, .. }) => {
                info!(status = %from, attempted = %to, "job already finalised elsewhere");
                Ok(false)
            }
            Err(JobStoreError::NotFound(_)) => {
                info!("job deleted while running");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_error(&self, record: &JobRecord, message: &str) {
        if let Err(e) = self
            .artifacts
            .save_text_atomic(record.id, record.paths.error_file_name(), message)
            .await
        {
            warn!(error = %e, "failed to write error artifact");
        }
    }

    fn job_dir(&self, record: &JobRecord) -> PathBuf {
        if record.paths.dir.as_os_str().is_empty() {
            self.artifacts.job_dir(record.id)
        } else {
            record.paths.dir.clone()
        }
    }

    fn process_input(&self, record: &JobRecord) -> ProcessInput {
        let dir = self.job_dir(record);
        let path_or = |doc: &Option<DocumentRef>, fallback: &str| {
            doc.as_ref()
                .map(|d| d.path.clone())
                .unwrap_or_else(|| dir.join(fallback))
        };
        ProcessInput {
            job_id: record.id,
            input_path: path_or(&record.paths.input, "input"),
            markdown_path: path_or(&record.paths.markdown, JobPaths::MARKDOWN_FILE),
            prompt_path: path_or(&record.paths.prompt, JobPaths::PROMPT_FILE),
            template_token: record.template_token.clone(),
            model: record.model.clone(),
        }
    }
}

/// Removes the user-cancel token of a run when the run ends.
struct Registration<'a> {
    running: &'a Mutex<HashMap<JobId, CancellationToken>>,
    id: JobId,
}

impl<'a> Registration<'a> {
    fn new(
        running: &'a Mutex<HashMap<JobId, CancellationToken>>,
        id: JobId,
        token: CancellationToken,
    ) -> Self {
        running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token);
        Self { running, id }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn flatten(
    joined: Result<Result<ProcessResult, super::processing::ProcessError>, JoinError>,
) -> Result<ProcessResult, String> {
    match joined {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.0),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "processing panicked".to_string());
            Err(message)
        }
        Err(_) => Err("processing task cancelled".to_string()),
    }
}
