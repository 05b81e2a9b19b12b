mod processor;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use docflow_infra::JobQueueConfig;
use docflow_infra::jobs::{JobQueue, open_store};

use processor::DescribeProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = JobQueueConfig::from_env()?;
    docflow_observability::init(config.log_format);

    let store = open_store(&config.database).await?;
    let shutdown = CancellationToken::new();
    let queue = JobQueue::start(config, store, Arc::new(DescribeProcessor), shutdown);

    let readiness = queue.readiness().await;
    if readiness.ready {
        tracing::info!(pending = ?readiness.pending, "worker ready");
    } else {
        tracing::warn!(reasons = ?readiness.reasons, "worker started but not ready");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    queue.shutdown().await;
    Ok(())
}
