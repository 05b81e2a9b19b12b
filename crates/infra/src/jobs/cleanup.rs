//! Daily TTL sweep over job records and their artifact directories.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docflow_core::{JobRecord, time};

use super::artifacts::ArtifactStore;
use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub directories_removed: usize,
    pub directory_errors: usize,
}

pub struct Cleanup {
    store: Arc<dyn JobStore>,
    artifacts: ArtifactStore,
    ttl: Duration,
}

impl Cleanup {
    pub fn new(store: Arc<dyn JobStore>, artifacts: ArtifactStore, ttl: Duration) -> Self {
        Self {
            store,
            artifacts,
            ttl,
        }
    }

    /// Delete records created before `now - ttl`, then their directories.
    ///
    /// Records go first; a directory that cannot be removed is logged and
    /// counted, never fatal.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, JobStoreError> {
        let cutoff = now
            .checked_sub_signed(time::delta(self.ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.store.delete_older_than(cutoff).await?;

        let mut report = CleanupReport {
            deleted: deleted.len(),
            ..CleanupReport::default()
        };
        for job in &deleted {
            let dir = self.job_dir(job);
            match self.artifacts.remove_dir(&dir).await {
                Ok(true) => report.directories_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to remove job directory");
                    report.directory_errors += 1;
                }
            }
        }

        info!(
            %cutoff,
            deleted = report.deleted,
            directories_removed = report.directories_removed,
            directory_errors = report.directory_errors,
            "cleanup finished"
        );
        Ok(report)
    }

    fn job_dir(&self, job: &JobRecord) -> std::path::PathBuf {
        if job.paths.dir.as_os_str().is_empty() {
            self.artifacts.job_dir(job.id)
        } else {
            job.paths.dir.clone()
        }
    }

    /// Next UTC `hour:minute` strictly after `now`.
    pub fn next_run_after(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
        let today = now
            .date_naive()
            .and_hms_opt(hour, minute, 0)
            .map(|t| t.and_utc());
        match today {
            Some(at) if at > now => at,
            Some(at) => at + TimeDelta::days(1),
            None => now + TimeDelta::days(1),
        }
    }

    /// Run daily at `hour:minute` UTC until `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        hour: u32,
        minute: u32,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = time::now();
                let next = Self::next_run_after(now, hour, minute);
                info!(next_run = %next, "cleanup scheduled");
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = self.run_once(time::now()).await {
                            warn!(error = %e, "cleanup failed");
                        }
                    }
                }
            }
            info!("cleanup stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn next_run_is_today_when_still_ahead() {
        assert_eq!(Cleanup::next_run_after(at(1, 0, 0), 3, 15), at(3, 15, 0));
    }

    #[test]
    fn next_run_rolls_over_to_tomorrow() {
        let next = Cleanup::next_run_after(at(3, 15, 0), 3, 15);
        assert_eq!(next, at(3, 15, 0) + TimeDelta::days(1));
        let next = Cleanup::next_run_after(at(23, 59, 59), 3, 15);
        assert_eq!(next, at(3, 15, 0) + TimeDelta::days(1));
    }
}
