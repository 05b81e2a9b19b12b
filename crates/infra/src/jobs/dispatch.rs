//! Channel-fed worker pool that hands job ids to a typed handler.
//!
//! The pool never retries: a failed handler is logged and counted, and the
//! job's own `attempts` field stays the only retry bookkeeping.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docflow_core::JobId;

use super::runner::{JobRunner, RunOptions};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
}

/// Typed entry point the pool invokes for each dispatched id.
///
/// Must tolerate ids whose record no longer exists.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, id: JobId, shutdown: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, id: JobId, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.run(id, shutdown, RunOptions::default()).await?;
        Ok(())
    }
}

/// Accepts job ids for asynchronous execution.
pub trait WorkDispatcher: Send + Sync {
    /// `Ok(false)` when the id is already queued or running.
    fn enqueue(&self, id: JobId) -> Result<bool, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            name: "job-workers".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub duplicates: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

struct Shared {
    tx: mpsc::UnboundedSender<JobId>,
    pending: Mutex<HashSet<JobId>>,
    stats: Mutex<DispatchStats>,
    shutdown: CancellationToken,
    started: Instant,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, DispatchStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap-to-clone sender side of the pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// Handle to stop the pool and read its statistics.
pub struct WorkerPoolHandle {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers. They stop when `shutdown` fires.
    pub fn spawn(
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
        shutdown: CancellationToken,
    ) -> (WorkerPool, WorkerPoolHandle) {
        let (tx, rx) = mpsc::unbounded_channel::<JobId>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared {
            tx,
            pending: Mutex::new(HashSet::new()),
            stats: Mutex::new(DispatchStats::default()),
            shutdown,
            started: Instant::now(),
        });

        let workers = (0..config.worker_count.max(1))
            .map(|n| {
                let worker = Worker {
                    name: format!("{}-{n}", config.name),
                    handler: Arc::clone(&handler),
                    rx: Arc::clone(&rx),
                    shared: Arc::clone(&shared),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(pool = %config.name, workers = config.worker_count.max(1), "worker pool started");
        (
            WorkerPool {
                shared: Arc::clone(&shared),
            },
            WorkerPoolHandle { shared, workers },
        )
    }

    pub fn stats(&self) -> DispatchStats {
        snapshot(&self.shared)
    }
}

impl WorkDispatcher for WorkerPool {
    fn enqueue(&self, id: JobId) -> Result<bool, DispatchError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        if !self.shared.pending().insert(id) {
            self.shared.stats().duplicates += 1;
            debug!(job_id = %id, "job already dispatched");
            return Ok(false);
        }
        if self.shared.tx.send(id).is_err() {
            self.shared.pending().remove(&id);
            return Err(DispatchError::Closed);
        }
        self.shared.stats().dispatched += 1;
        debug!(job_id = %id, "job dispatched");
        Ok(true)
    }
}

impl WorkerPoolHandle {
    /// Request shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        self.shared.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        snapshot(&self.shared)
    }
}

fn snapshot(shared: &Shared) -> DispatchStats {
    let mut stats = shared.stats().clone();
    stats.uptime_secs = shared.started.elapsed().as_secs();
    stats
}

struct Worker {
    name: String,
    handler: Arc<dyn JobHandler>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.name, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => None,
                id = async { self.rx.lock().await.recv().await } => id,
            };
            let Some(id) = next else { break };

            self.shared.stats().in_flight += 1;

            // Own task so a panicking handler cannot take the worker down.
            let handler = Arc::clone(&self.handler);
            let shutdown = self.shared.shutdown.clone();
            let joined = tokio::spawn(async move { handler.handle(id, shutdown).await }).await;

            self.shared.pending().remove(&id);
            let mut stats = self.shared.stats();
            stats.in_flight = stats.in_flight.saturating_sub(1);
            match joined {
                Ok(Ok(())) => stats.succeeded += 1,
                Ok(Err(e)) => {
                    stats.failed += 1;
                    debug!(worker = %self.name, job_id = %id, error = %e, "job handler failed");
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(worker = %self.name, job_id = %id, error = %e, "job handler panicked");
                }
            }
        }
        debug!(worker = %self.name, "worker stopped");
    }
}
