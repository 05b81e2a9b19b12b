//! Admission control for heavy jobs.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("cancelled while waiting for a concurrency slot")]
    Cancelled,
    #[error("concurrency gate closed")]
    Closed,
}

/// Counting gate bounding how many heavy executions run at once.
///
/// Independent of the number of dispatch workers; this is the only
/// mutual-exclusion primitive jobs share. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One occupied slot. Released on [`GatePermit::release`] or on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn release(self) {}
}

impl ConcurrencyGate {
    /// A gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot, giving up when `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map(|p| GatePermit { _permit: p })
                .map_err(|_| GateError::Closed),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_enter(&self) -> Option<GatePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|p| GatePermit { _permit: p })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn try_enter_respects_capacity() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.try_enter().unwrap();
        let _b = gate.try_enter().unwrap();
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.in_use(), 2);

        a.release();
        assert_eq!(gate.in_use(), 1);
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn wait_gives_up_on_cancel() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.try_enter().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err(), GateError::Cancelled);
        assert_eq!(gate.in_use(), 1);
    }

    #[test]
    fn zero_capacity_becomes_one() {
        assert_eq!(ConcurrencyGate::new(0).capacity(), 1);
    }
}
