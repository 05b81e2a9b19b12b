//! Timestamp helpers shared by both storage backends.

use chrono::{DateTime, SubsecRound, Utc};

/// Current UTC time truncated to millisecond precision.
///
/// Both job store backends persist timestamps at millisecond resolution, so
/// every timestamp written into a record goes through here.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Convert a `std` duration into a chrono delta, saturating on overflow.
pub fn delta(duration: std::time::Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// Truncate a caller-supplied timestamp to the stored precision.
pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}
