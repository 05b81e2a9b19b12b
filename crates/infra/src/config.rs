//! Job queue configuration.
//!
//! One `JobQueueConfig` value is built at startup and handed to every
//! component by construction. Nothing reads the environment after that.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docflow_observability::LogFormat;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which `JobStore` adapter backs the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    #[default]
    Sqlite,
    Document,
}

impl FromStr for StoreProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreProvider::Sqlite),
            "document" | "litedb" => Ok(StoreProvider::Document),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub provider: StoreProvider,
    /// SQLite connection string, or the collection file path for the
    /// document store.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: StoreProvider::Sqlite,
            url: "sqlite://./data/jobs.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_queue_length: u64,
    pub lease_window_secs: u64,
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub dedupe_window_mins: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 100,
            lease_window_secs: 120,
            max_attempts: 5,
            poll_interval_secs: 10,
            heartbeat_interval_secs: 10,
            dedupe_window_mins: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Capacity of the heavy-job gate.
    pub max_parallel_heavy_jobs: usize,
    pub worker_count: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_heavy_jobs: 2,
            worker_count: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub job_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_request_body_mb: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_request_body_mb: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmediateConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub fallback_to_queue: bool,
}

impl Default for ImmediateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 30,
            fallback_to_queue: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub daily_hour: u32,
    pub daily_minute: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_hour: 3,
            daily_minute: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueConfig {
    pub data_root: PathBuf,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub upload: UploadConfig,
    pub immediate: ImmediateConfig,
    pub cleanup: CleanupConfig,
    pub job_ttl_days: u32,
    pub log_format: LogFormat,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data/jobs"),
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            timeouts: TimeoutConfig::default(),
            upload: UploadConfig::default(),
            immediate: ImmediateConfig::default(),
            cleanup: CleanupConfig::default(),
            job_ttl_days: 14,
            log_format: LogFormat::Json,
        }
    }
}

impl JobQueueConfig {
    /// Load from `DOCFLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup. Unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env { lookup: &lookup };

        if let Some(v) = env.raw("DOCFLOW_DATA_ROOT") {
            cfg.data_root = PathBuf::from(v);
        }
        if let Some(v) = env.raw("DOCFLOW_DB_PROVIDER") {
            cfg.database.provider = StoreProvider::from_str(&v).map_err(|_| ConfigError::Parse {
                key: "DOCFLOW_DB_PROVIDER",
                value: v.clone(),
            })?;
            if cfg.database.provider == StoreProvider::Document {
                cfg.database.url = "./data/jobs.json".to_string();
            }
        }
        if let Some(v) = env.raw("DOCFLOW_DB_URL") {
            cfg.database.url = v;
        }

        env.parse("DOCFLOW_MAX_QUEUE_LENGTH", &mut cfg.queue.max_queue_length)?;
        env.parse("DOCFLOW_LEASE_WINDOW_SECS", &mut cfg.queue.lease_window_secs)?;
        env.parse("DOCFLOW_MAX_ATTEMPTS", &mut cfg.queue.max_attempts)?;
        env.parse("DOCFLOW_POLL_INTERVAL_SECS", &mut cfg.queue.poll_interval_secs)?;
        env.parse("DOCFLOW_HEARTBEAT_INTERVAL_SECS", &mut cfg.queue.heartbeat_interval_secs)?;
        env.parse("DOCFLOW_DEDUPE_WINDOW_MINS", &mut cfg.queue.dedupe_window_mins)?;
        env.parse(
            "DOCFLOW_MAX_PARALLEL_HEAVY_JOBS",
            &mut cfg.concurrency.max_parallel_heavy_jobs,
        )?;
        env.parse("DOCFLOW_WORKER_COUNT", &mut cfg.concurrency.worker_count)?;
        env.parse("DOCFLOW_JOB_TIMEOUT_SECS", &mut cfg.timeouts.job_timeout_secs)?;
        env.parse("DOCFLOW_MAX_REQUEST_BODY_MB", &mut cfg.upload.max_request_body_mb)?;
        env.parse("DOCFLOW_IMMEDIATE_ENABLED", &mut cfg.immediate.enabled)?;
        env.parse("DOCFLOW_IMMEDIATE_TIMEOUT_SECS", &mut cfg.immediate.timeout_secs)?;
        env.parse(
            "DOCFLOW_IMMEDIATE_FALLBACK_TO_QUEUE",
            &mut cfg.immediate.fallback_to_queue,
        )?;
        env.parse("DOCFLOW_CLEANUP_ENABLED", &mut cfg.cleanup.enabled)?;
        env.parse("DOCFLOW_CLEANUP_DAILY_HOUR", &mut cfg.cleanup.daily_hour)?;
        env.parse("DOCFLOW_CLEANUP_DAILY_MINUTE", &mut cfg.cleanup.daily_minute)?;
        env.parse("DOCFLOW_JOB_TTL_DAYS", &mut cfg.job_ttl_days)?;
        if let Some(v) = env.raw("DOCFLOW_LOG_FORMAT") {
            cfg.log_format = v.parse().map_err(|_| ConfigError::Parse {
                key: "DOCFLOW_LOG_FORMAT",
                value: v.clone(),
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 9] = [
            (
                self.concurrency.max_parallel_heavy_jobs >= 1,
                "max_parallel_heavy_jobs must be at least 1",
            ),
            (self.concurrency.worker_count >= 1, "worker_count must be at least 1"),
            (self.queue.max_attempts >= 1, "max_attempts must be at least 1"),
            (self.queue.lease_window_secs >= 1, "lease_window_secs must be at least 1"),
            (self.queue.poll_interval_secs >= 1, "poll_interval_secs must be at least 1"),
            (
                self.queue.heartbeat_interval_secs < self.queue.lease_window_secs,
                "heartbeat_interval_secs must be shorter than lease_window_secs",
            ),
            (self.cleanup.daily_hour < 24, "cleanup daily_hour must be below 24"),
            (self.cleanup.daily_minute < 60, "cleanup daily_minute must be below 60"),
            (self.job_ttl_days >= 1, "job_ttl_days must be at least 1"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn lease_window(&self) -> Duration {
        Duration::from_secs(self.queue.lease_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.queue.poll_interval_secs)
    }

    /// Zero disables the heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.queue.heartbeat_interval_secs)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.queue.dedupe_window_mins.saturating_mul(60))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.job_timeout_secs)
    }

    pub fn immediate_timeout(&self) -> Duration {
        Duration::from_secs(self.immediate.timeout_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.job_ttl_days) * 24 * 60 * 60)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.upload.max_request_body_mb.saturating_mul(1024 * 1024)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(v) = self.raw(key) {
            *slot = v.trim().parse().map_err(|_| ConfigError::Parse { key, value: v })?;
        }
        Ok(())
    }
}
