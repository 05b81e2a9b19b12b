//! Per-run deadline merging shutdown, user cancellation and a timeout.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which source ended a run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Process shutdown.
    Shutdown,
    /// Per-job timeout elapsed.
    Timeout,
    /// Caller cancelled this job.
    User,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Shutdown => "shutdown",
            CancelReason::Timeout => "timeout",
            CancelReason::User => "user",
        }
    }
}

impl core::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined deadline for one job run.
///
/// `token()` is handed to the processing collaborator; it fires as soon as
/// any source fires. [`JobDeadline::fired`] reports which one did. When
/// several fire together the order is shutdown, user, timeout.
#[derive(Debug)]
pub struct JobDeadline {
    shutdown: CancellationToken,
    user: CancellationToken,
    expires_at: Instant,
    combined: CancellationToken,
}

impl JobDeadline {
    pub fn new(shutdown: CancellationToken, user: CancellationToken, timeout: Duration) -> Self {
        let expires_at = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
        Self {
            combined: shutdown.child_token(),
            shutdown,
            user,
            expires_at,
        }
    }

    /// Token that fires when the deadline does.
    pub fn token(&self) -> CancellationToken {
        self.combined.clone()
    }

    /// Resolve once any source fires; also cancels the combined token.
    pub async fn fired(&self) -> CancelReason {
        let reason = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CancelReason::Shutdown,
            _ = self.user.cancelled() => CancelReason::User,
            _ = tokio::time::sleep_until(self.expires_at) => CancelReason::Timeout,
        };
        self.combined.cancel();
        reason
    }

    /// Which source has fired so far, if any, without waiting.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.shutdown.is_cancelled() {
            Some(CancelReason::Shutdown)
        } else if self.user.is_cancelled() {
            Some(CancelReason::User)
        } else if Instant::now() >= self.expires_at {
            Some(CancelReason::Timeout)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_and_cancels_token() {
        let deadline = JobDeadline::new(
            CancellationToken::new(),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        let token = deadline.token();
        assert_eq!(deadline.fired().await, CancelReason::Timeout);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wins_over_user() {
        let shutdown = CancellationToken::new();
        let user = CancellationToken::new();
        let deadline = JobDeadline::new(shutdown.clone(), user.clone(), Duration::from_secs(30));
        user.cancel();
        shutdown.cancel();
        assert_eq!(deadline.fired().await, CancelReason::Shutdown);
        assert_eq!(deadline.reason(), Some(CancelReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn user_cancel_is_reported() {
        let user = CancellationToken::new();
        let deadline =
            JobDeadline::new(CancellationToken::new(), user.clone(), Duration::from_secs(30));
        assert_eq!(deadline.reason(), None);
        user.cancel();
        assert_eq!(deadline.fired().await, CancelReason::User);
    }
}
