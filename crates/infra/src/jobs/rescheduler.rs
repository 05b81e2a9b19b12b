//! Periodic reconciliation: dispatch due work and reap expired leases.
//!
//! This loop is the only thing that notices a worker died mid-run. Both
//! scans re-evaluate store predicates, so running a tick twice is harmless.
//! Only one rescheduler may run against a given store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docflow_core::{JobRecord, backoff_for_attempt, time};

use super::artifacts::ArtifactStore;
use super::dispatch::WorkDispatcher;
use super::store::{JobStore, JobStoreError};

pub const MAX_ATTEMPTS_REACHED: &str = "max attempts reached";

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    /// Due jobs the dispatcher already had.
    pub already_dispatched: usize,
    pub requeued: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct Rescheduler {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn WorkDispatcher>,
    artifacts: ArtifactStore,
    max_attempts: u32,
}

impl Rescheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn WorkDispatcher>,
        artifacts: ArtifactStore,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            dispatcher,
            artifacts,
            max_attempts,
        }
    }

    /// Run both scans once. Per-job failures are logged and counted; they
    /// never stop the rest of the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        self.dispatch_due(now, &mut report).await;
        self.reap_expired(now, &mut report).await;
        if report != TickReport::default() {
            info!(
                dispatched = report.dispatched,
                requeued = report.requeued,
                failed = report.failed,
                errors = report.errors,
                "rescheduler tick"
            );
        }
        report
    }

    async fn dispatch_due(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let due = match self.store.find_queued_due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due jobs");
                report.errors += 1;
                return;
            }
        };
        for job in due {
            match self.dispatcher.enqueue(job.id) {
                Ok(true) => report.dispatched += 1,
                Ok(false) => report.already_dispatched += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to dispatch job");
                    report.errors += 1;
                }
            }
        }
    }

    async fn reap_expired(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let expired = match self.store.find_running_expired(now).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "failed to load expired leases");
                report.errors += 1;
                return;
            }
        };
        for job in expired {
            match self.reap(&job, now).await {
                Ok(true) => report.requeued += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to reap expired lease");
                    report.errors += 1;
                }
            }
        }
    }

    /// `Ok(true)` when requeued, `Ok(false)` when failed for good.
    async fn reap(&self, job: &JobRecord, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let attempt = job.attempts.saturating_add(1);
        if attempt <= self.max_attempts {
            let available_at = now + time::delta(backoff_for_attempt(attempt));
            self.store.requeue(job.id, attempt, available_at).await?;
            warn!(job_id = %job.id, attempt, %available_at, "lease expired, requeued");
            return Ok(true);
        }

        if let Err(e) = self
            .artifacts
            .save_text_atomic(job.id, job.paths.error_file_name(), MAX_ATTEMPTS_REACHED)
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to write error artifact");
        }
        self.store.mark_failed(job.id, MAX_ATTEMPTS_REACHED).await?;
        warn!(job_id = %job.id, attempts = job.attempts, "lease expired, max attempts reached");
        Ok(false)
    }

    /// Tick every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "rescheduler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.tick(time::now()).await;
                        debug!(?report, "tick done");
                    }
                }
            }
            info!("rescheduler stopped");
        })
    }
}
