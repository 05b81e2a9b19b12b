//! Fixed escalating delay applied when a job with an expired lease is requeued.

use std::time::Duration;

/// Delay per attempt, indexed by attempt 1..=5.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(240),
];

/// Delay before `attempt` becomes eligible again.
///
/// Attempt 0 is treated as attempt 1; anything beyond the table clamps to
/// its last entry.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[idx]
}
