//! List filtering and pagination for job listings.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobRecord, JobStatus};
use crate::time;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filter applied by `list_paged_filtered`. An empty query matches every job.
///
/// Text matching folds ASCII case only and date bounds compare at millisecond
/// precision, which is what the SQLite adapter can express; every adapter
/// matches the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    /// ASCII case-insensitive substring of the job id or the input path.
    pub text: Option<String>,
    /// Any-of status set. Empty means no restriction.
    pub statuses: HashSet<JobStatus>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    pub immediate: Option<bool>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.text = if text.trim().is_empty() { None } else { Some(text) };
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn created_between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    /// ASCII lower-cased search text, trimmed; `None` when the query has no text.
    pub fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_ascii_lowercase)
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        let created_at = time::truncate(record.created_at);
        if self.from.is_some_and(|from| created_at < time::truncate(from)) {
            return false;
        }
        if self.to.is_some_and(|to| created_at > time::truncate(to)) {
            return false;
        }
        if self.immediate.is_some_and(|flag| record.immediate != flag) {
            return false;
        }
        match self.needle() {
            None => true,
            Some(needle) => {
                let id_hit = record.id.to_string().contains(&needle)
                    || record.id.simple().contains(&needle);
                let path_hit = record.paths.input_path().is_some_and(|p| {
                    p.to_string_lossy().to_ascii_lowercase().contains(&needle)
                });
                id_hit || path_hit
            }
        }
    }
}

/// Clamp a requested page/page-size pair: page < 1 becomes 1, size 0 becomes
/// the default, size above the maximum becomes the maximum.
pub fn clamp_page(page: u32, page_size: u32) -> (u32, u32) {
    let page = page.max(1);
    let page_size = match page_size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };
    (page, page_size)
}

/// One page of a listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<JobRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl JobPage {
    pub fn offset(page: u32, page_size: u32) -> u64 {
        u64::from(page.saturating_sub(1)) * u64::from(page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::JobId;
    use crate::job::JobPaths;

    #[test]
    fn clamps_page_and_size() {
        assert_eq!(clamp_page(0, 0), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(clamp_page(3, 500), (3, MAX_PAGE_SIZE));
        assert_eq!(clamp_page(2, 50), (2, 50));
    }

    #[test]
    fn text_matches_input_path_case_insensitively() {
        let record = JobRecord::queued(JobId::new())
            .with_paths(JobPaths::in_dir("/data/Invoice-2024", "input.pdf"));

        assert!(JobQuery::new().text("invoice").matches(&record));
        assert!(!JobQuery::new().text("receipt").matches(&record));
        assert!(JobQuery::new().text("   ").matches(&record));
    }

    #[test]
    fn text_matches_id() {
        let id = JobId::new();
        let record = JobRecord::queued(id);
        let fragment = id.simple()[..8].to_string();
        assert!(JobQuery::new().text(fragment).matches(&record));
    }

    #[test]
    fn statuses_are_any_of() {
        let record = JobRecord::queued(JobId::new());
        let q = JobQuery::new().status(JobStatus::Running).status(JobStatus::Queued);
        assert!(q.matches(&record));
        assert!(!JobQuery::new().status(JobStatus::Failed).matches(&record));
    }

    #[test]
    fn date_bounds_are_inclusive() {
        let record = JobRecord::queued(JobId::new());
        let at = record.created_at;
        assert!(JobQuery::new().created_between(Some(at), Some(at)).matches(&record));
        assert!(!JobQuery::new()
            .created_between(Some(at + chrono::TimeDelta::milliseconds(1)), None)
            .matches(&record));
    }

    #[test]
    fn bounds_ignore_sub_millisecond_parts() {
        let record = JobRecord::queued(JobId::new());
        let at = time::truncate(record.created_at);
        let within_ms = at + chrono::TimeDelta::microseconds(600);
        assert!(JobQuery::new().created_between(Some(within_ms), None).matches(&record));
        assert!(JobQuery::new().created_between(None, Some(within_ms)).matches(&record));
    }

    #[test]
    fn text_folds_ascii_case_only() {
        let record = JobRecord::queued(JobId::new())
            .with_paths(JobPaths::in_dir("/data/ÄRGER-Invoice", "input.pdf"));

        assert!(JobQuery::new().text("INVOICE").matches(&record));
        assert!(JobQuery::new().text("Ärger").matches(&record));
        assert!(!JobQuery::new().text("ärger").matches(&record));
    }

    #[test]
    fn immediate_flag() {
        let record = JobRecord::queued(JobId::new()).immediate(true);
        assert!(JobQuery::new().immediate(true).matches(&record));
        assert!(!JobQuery::new().immediate(false).matches(&record));
    }
}
