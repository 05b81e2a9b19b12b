//! Readiness check over the data root and the job store.

use serde::Serialize;
use tracing::warn;

use super::artifacts::ArtifactStore;
use super::store::JobStore;

pub const DATA_ROOT_NOT_WRITABLE: &str = "data_root_not_writable";
pub const DB_UNAVAILABLE: &str = "db_unavailable";
pub const BACKPRESSURE: &str = "backpressure";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// Queued plus Running; `None` when the store could not be read.
    pub pending: Option<u64>,
    pub reasons: Vec<&'static str>,
}

/// Not ready when the data root refuses writes, the store is unreachable,
/// or pending work reaches twice the queue limit.
pub async fn check_readiness(
    store: &dyn JobStore,
    artifacts: &ArtifactStore,
    max_queue_length: u64,
) -> Readiness {
    let mut reasons = Vec::new();

    if let Err(e) = artifacts.check_writable().await {
        warn!(error = %e, "data root not writable");
        reasons.push(DATA_ROOT_NOT_WRITABLE);
    }

    let pending = match store.count_pending().await {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(error = %e, "job store unavailable");
            reasons.push(DB_UNAVAILABLE);
            None
        }
    };
    if pending.is_some_and(|n| n >= max_queue_length.saturating_mul(2)) {
        reasons.push(BACKPRESSURE);
    }

    Readiness {
        ready: reasons.is_empty(),
        pending,
        reasons,
    }
}
