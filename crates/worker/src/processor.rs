//! Stand-in processing collaborator for running the queue without a model
//! backend. It describes the input document instead of extracting from it.

use tokio_util::sync::CancellationToken;

use docflow_core::time;
use docflow_infra::jobs::{ArtifactTimestamps, ProcessError, ProcessInput, ProcessResult, Processor};

pub struct DescribeProcessor;

#[async_trait::async_trait]
impl Processor for DescribeProcessor {
    async fn execute(
        &self,
        input: ProcessInput,
        cancel: CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        let bytes = tokio::fs::read(&input.input_path)
            .await
            .map_err(|e| ProcessError::new(format!("failed to read input: {e}")))?;
        if cancel.is_cancelled() {
            return Err(ProcessError::new("cancelled"));
        }

        let file_name = input
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let markdown = format!("# {file_name}\n\n{} bytes\n", bytes.len());
        tokio::fs::write(&input.markdown_path, markdown)
            .await
            .map_err(|e| ProcessError::new(format!("failed to write markdown: {e}")))?;
        let markdown_created_at = time::now();

        let output = serde_json::json!({
            "job_id": input.job_id,
            "file_name": file_name,
            "input_bytes": bytes.len(),
            "model": input.model,
            "template_token": input.template_token,
        });

        Ok(
            ProcessResult::success(output.to_string()).with_artifacts(ArtifactTimestamps {
                markdown_created_at: Some(markdown_created_at),
                output_created_at: None,
            }),
        )
    }
}
