//! `docflow-core`: job queue domain building blocks.
//!
//! This crate contains the **pure domain** of the job scheduler: the job record,
//! its state machine, the retry backoff table and list query types. No I/O.

pub mod backoff;
pub mod error;
pub mod id;
pub mod job;
pub mod query;
pub mod time;

pub use backoff::{BACKOFF_SCHEDULE, backoff_for_attempt};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DocumentRef, JobMetrics, JobPaths, JobRecord, JobStatus, StatusUpdate};
pub use query::{DEFAULT_PAGE_SIZE, JobPage, JobQuery, MAX_PAGE_SIZE, clamp_page};
