//! Infrastructure layer: storage adapters, configuration and the job runtime.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, JobQueueConfig};
