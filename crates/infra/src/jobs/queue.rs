//! Wires the job runtime together from one configuration value.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use docflow_core::{JobId, JobRecord};

use crate::config::JobQueueConfig;

use super::artifacts::ArtifactStore;
use super::cleanup::Cleanup;
use super::dispatch::{DispatchStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use super::gate::ConcurrencyGate;
use super::health::{Readiness, check_readiness};
use super::processing::Processor;
use super::rescheduler::Rescheduler;
use super::runner::{CANCELLED_BY_USER, JobRunner, RunnerConfig};
use super::store::{JobStore, JobStoreError};
use super::submit::{JobSubmitter, SubmitConfig, SubmitError};

/// Running job queue: worker pool, rescheduler and cleanup loops.
pub struct JobQueue {
    config: JobQueueConfig,
    store: Arc<dyn JobStore>,
    artifacts: ArtifactStore,
    runner: Arc<JobRunner>,
    submitter: Arc<JobSubmitter>,
    pool: WorkerPool,
    pool_handle: WorkerPoolHandle,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl JobQueue {
    /// Build every component and start the background loops. They stop
    /// when `shutdown` fires or [`JobQueue::shutdown`] is called.
    pub fn start(
        config: JobQueueConfig,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn Processor>,
        shutdown: CancellationToken,
    ) -> Self {
        let artifacts = ArtifactStore::new(&config.data_root);
        let gate = ConcurrencyGate::new(config.concurrency.max_parallel_heavy_jobs);
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            artifacts.clone(),
            processor,
            gate,
            RunnerConfig::from(&config),
        ));

        let (pool, pool_handle) = WorkerPool::spawn(
            runner.clone(),
            WorkerPoolConfig::default().with_worker_count(config.concurrency.worker_count),
            shutdown.clone(),
        );
        let dispatcher = Arc::new(pool.clone());

        let submitter = Arc::new(JobSubmitter::new(
            Arc::clone(&store),
            artifacts.clone(),
            dispatcher.clone(),
            Arc::clone(&runner),
            SubmitConfig::from(&config),
            shutdown.clone(),
        ));

        let mut tasks = Vec::new();
        let rescheduler = Arc::new(Rescheduler::new(
            Arc::clone(&store),
            dispatcher,
            artifacts.clone(),
            config.queue.max_attempts,
        ));
        tasks.push(rescheduler.spawn(config.poll_interval(), shutdown.clone()));

        if config.cleanup.enabled {
            let cleanup = Arc::new(Cleanup::new(
                Arc::clone(&store),
                artifacts.clone(),
                config.job_ttl(),
            ));
            tasks.push(cleanup.spawn(
                config.cleanup.daily_hour,
                config.cleanup.daily_minute,
                shutdown.clone(),
            ));
        }

        info!(
            data_root = %config.data_root.display(),
            workers = config.concurrency.worker_count,
            gate_capacity = config.concurrency.max_parallel_heavy_jobs,
            "job queue started"
        );

        Self {
            config,
            store,
            artifacts,
            runner,
            submitter,
            pool,
            pool_handle,
            tasks,
            shutdown,
        }
    }

    pub fn submitter(&self) -> Arc<JobSubmitter> {
        Arc::clone(&self.submitter)
    }

    pub fn runner(&self) -> Arc<JobRunner> {
        Arc::clone(&self.runner)
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.store.get(id).await
    }

    /// Cancel a Queued or Running job on behalf of a caller.
    pub async fn cancel(&self, id: JobId) -> Result<JobRecord, SubmitError> {
        let job = self.store.get(id).await?.ok_or(SubmitError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(SubmitError::Conflict {
                id,
                status: job.status,
            });
        }

        match self.store.mark_cancelled(id, CANCELLED_BY_USER).await {
            Ok(()) => {}
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                return Err(SubmitError::Conflict { id, status: from });
            }
            Err(JobStoreError::NotFound(_)) => return Err(SubmitError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }
        let signalled = self.runner.cancel(id);
        info!(job_id = %id, signalled, "job cancelled by user");

        self.store.get(id).await?.ok_or(SubmitError::NotFound(id))
    }

    pub async fn readiness(&self) -> Readiness {
        check_readiness(
            self.store.as_ref(),
            &self.artifacts,
            self.config.queue.max_queue_length,
        )
        .await
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.pool.stats()
    }

    /// Stop every loop and wait for in-flight runs to settle.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }
        self.pool_handle.shutdown().await;
        info!("job queue stopped");
    }
}
