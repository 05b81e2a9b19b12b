//! The job record and its lifecycle state machine.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Job lifecycle status.
///
/// ```text
/// Queued ──► Running ──► Succeeded | Failed | Cancelled
///   ▲           │
///   └───────────┘  (requeue after lease expiry)
/// ```
///
/// Terminal states are never exited. `Running -> Queued` is the only
/// transition that moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued or Running; what the health check counts as outstanding work.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Whether a record currently in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Queued => matches!(self, JobStatus::Queued | JobStatus::Running),
            _ => true,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Reference to one artifact file of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
}

impl DocumentRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created_at: None,
        }
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// File name component of the path, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Artifact locations of a job. The bytes belong to the filesystem; the
/// record only keeps the paths for traceability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub input: Option<DocumentRef>,
    pub prompt: Option<DocumentRef>,
    pub markdown: Option<DocumentRef>,
    pub output: Option<DocumentRef>,
    pub error: Option<DocumentRef>,
}

impl JobPaths {
    pub const PROMPT_FILE: &'static str = "prompt.md";
    pub const MARKDOWN_FILE: &'static str = "markdown.md";
    pub const OUTPUT_FILE: &'static str = "output.json";
    pub const ERROR_FILE: &'static str = "error.txt";

    /// Standard layout for a job directory: every artifact path is assigned
    /// up front so callers can always find where a file will land.
    pub fn in_dir(dir: impl Into<PathBuf>, input_file: &str) -> Self {
        let dir = dir.into();
        Self {
            input: Some(DocumentRef::new(dir.join(input_file))),
            prompt: Some(DocumentRef::new(dir.join(Self::PROMPT_FILE))),
            markdown: Some(DocumentRef::new(dir.join(Self::MARKDOWN_FILE))),
            output: Some(DocumentRef::new(dir.join(Self::OUTPUT_FILE))),
            error: Some(DocumentRef::new(dir.join(Self::ERROR_FILE))),
            dir,
        }
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input.as_ref().map(|d| d.path.as_path())
    }

    pub fn output_file_name(&self) -> &str {
        self.output
            .as_ref()
            .and_then(DocumentRef::file_name)
            .unwrap_or(Self::OUTPUT_FILE)
    }

    pub fn error_file_name(&self) -> &str {
        self.error
            .as_ref()
            .and_then(DocumentRef::file_name)
            .unwrap_or(Self::ERROR_FILE)
    }
}

/// Execution timing of the latest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// A status change together with the metric fields it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn ended(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// One unit of document-processing work and its lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    /// Incremented once per execution start and by requeue; never decremented.
    pub attempts: u32,
    /// Stored only. No scheduling decision reads it.
    pub priority: i32,
    pub available_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metrics: JobMetrics,
    pub idempotency_key: Option<String>,
    pub hash: String,
    pub paths: JobPaths,
    pub error_message: Option<String>,
    pub model: String,
    pub template_token: String,
    pub immediate: bool,
}

impl JobRecord {
    /// A fresh Queued record. `created_at`/`updated_at` are overwritten by
    /// the store on create.
    pub fn queued(id: JobId) -> Self {
        let now = crate::time::now();
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0,
            attempts: 0,
            priority: 0,
            available_at: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
            metrics: JobMetrics::default(),
            idempotency_key: None,
            hash: String::new(),
            paths: JobPaths::default(),
            error_message: None,
            model: String::new(),
            template_token: String::new(),
            immediate: false,
        }
    }

    pub fn with_paths(mut self, paths: JobPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, template_token: impl Into<String>) -> Self {
        self.model = model.into();
        self.template_token = template_token.into();
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Dispatch-eligible: Queued and not held back by a future `available_at`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at.is_none_or(|at| at <= now)
    }

    /// Running with a lease that ran out: the worker is presumed dead.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_until.is_some_and(|at| at <= now)
    }

    pub fn apply_status(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(DomainError::invalid_transition(self.status, update.status));
        }
        self.status = update.status;
        self.error_message = update.error_message.clone();
        if let Some(at) = update.started_at {
            self.metrics.started_at = Some(at);
        }
        if let Some(at) = update.ended_at {
            self.metrics.ended_at = Some(at);
        }
        if let Some(ms) = update.duration_ms {
            self.metrics.duration_ms = Some(ms);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8, now: DateTime<Utc>) {
        self.progress = progress.min(100);
        self.updated_at = now;
    }

    pub fn increment_attempts(&mut self, now: DateTime<Utc>) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        self.attempts
    }

    pub fn touch_lease(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.lease_until = Some(lease_until);
        self.updated_at = now;
    }

    /// Back to Queued after an expired lease. `attempts` never moves
    /// backwards, even if a caller passes a smaller value.
    pub fn requeue(
        &mut self,
        attempts: u32,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(JobStatus::Queued) {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Queued));
        }
        self.status = JobStatus::Queued;
        self.attempts = self.attempts.max(attempts);
        self.available_at = Some(available_at);
        self.lease_until = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_paths(&mut self, paths: JobPaths, now: DateTime<Utc>) {
        self.paths = paths;
        self.updated_at = now;
    }
}
