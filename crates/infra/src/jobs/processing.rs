//! Port to the document-processing collaborator.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use docflow_core::JobId;

/// Everything the collaborator needs to process one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInput {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub markdown_path: PathBuf,
    pub prompt_path: PathBuf,
    pub template_token: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success { output_json: String },
    Failure { error_message: String },
}

/// When the collaborator produced each artifact, if it did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactTimestamps {
    pub markdown_created_at: Option<DateTime<Utc>>,
    pub output_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub outcome: ProcessOutcome,
    pub artifacts: ArtifactTimestamps,
}

impl ProcessResult {
    pub fn success(output_json: impl Into<String>) -> Self {
        Self {
            outcome: ProcessOutcome::Success {
                output_json: output_json.into(),
            },
            artifacts: ArtifactTimestamps::default(),
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            outcome: ProcessOutcome::Failure {
                error_message: error_message.into(),
            },
            artifacts: ArtifactTimestamps::default(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactTimestamps) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// An error the collaborator raised instead of returning a result.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Document-processing collaborator.
///
/// Implementations must tolerate being called again for the same job and
/// should return promptly once `cancel` fires.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    async fn execute(
        &self,
        input: ProcessInput,
        cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError>;
}
