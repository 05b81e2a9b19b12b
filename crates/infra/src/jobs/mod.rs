//! Durable document-processing job queue.
//!
//! ## Design
//!
//! - Job records live behind the `JobStore` port (SQLite or document file)
//! - A counting gate bounds heavy executions independent of worker count
//! - `JobRunner` drives one job to a terminal state and persists the outcome
//! - `Rescheduler` dispatches due work and requeues jobs with expired leases
//! - `Cleanup` deletes records and artifact directories past their TTL
//!
//! Single process only: two schedulers against one store are not supported.

pub mod artifacts;
pub mod cleanup;
pub mod deadline;
pub mod dispatch;
pub mod document;
pub mod gate;
pub mod health;
pub mod processing;
pub mod queue;
pub mod rescheduler;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod submit;

pub use artifacts::{ArtifactError, ArtifactStore};
pub use cleanup::{Cleanup, CleanupReport};
pub use deadline::{CancelReason, JobDeadline};
pub use dispatch::{
    DispatchError, DispatchStats, JobHandler, WorkDispatcher, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};
pub use document::DocumentJobStore;
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use health::{Readiness, check_readiness};
pub use processing::{
    ArtifactTimestamps, ProcessError, ProcessInput, ProcessOutcome, ProcessResult, Processor,
};
pub use queue::JobQueue;
pub use rescheduler::{Rescheduler, TickReport};
pub use runner::{JobRunError, JobRunner, RunOptions, RunOutcome, RunnerConfig};
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, JobStoreError, open_store};
pub use submit::{
    Disposition, ImmediateSubmission, JobSubmitter, NewJob, SubmitConfig, SubmitError, Submission,
};
