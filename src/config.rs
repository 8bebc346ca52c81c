//! Engine configuration.
//!
//! Settings come from defaults, then `JOBFORGE_*` environment variables,
//! then builder calls. Every path ends in [`EngineConfig::validate`].

use std::path::PathBuf;
use std::time::Duration;

use crate::allocator::{DEFAULT_BATCH_CAPACITY, DEFAULT_FOLDER_CAPACITY};
use crate::analytics::DEFAULT_SAMPLE_SIZE;
use crate::error::ConfigError;
use crate::queue::{DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY_DATASET};

/// Configuration for the job engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Storage settings
    /// PostgreSQL URL. Without one, the engine runs on in-memory stores.
    pub database_url: Option<String>,
    /// Redis URL. When set, counters live in Redis instead of Postgres.
    pub redis_url: Option<String>,
    /// Prefix for all Redis counter keys.
    pub redis_prefix: String,
    /// Root directory of the filesystem object store.
    pub object_root: PathBuf,

    // Allocation settings
    /// Files per folder for sequential paths.
    pub folder_capacity: u64,
    /// Records per batch file.
    pub batch_capacity: usize,

    // Queue settings
    /// Dataset whose jobs are always dequeued first.
    pub priority_dataset: String,
    /// Lease granted to a worker on dequeue.
    pub lease: Duration,
    /// Time between reaper passes.
    pub reap_interval: Duration,
    /// Claims allowed before an expired job is failed.
    pub max_attempts: u32,

    // Analytics settings
    pub rate_cache_ttl: Duration,
    pub rate_sample_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            redis_prefix: "jobforge".to_string(),
            object_root: PathBuf::from("./objects"),

            folder_capacity: DEFAULT_FOLDER_CAPACITY,
            batch_capacity: DEFAULT_BATCH_CAPACITY,

            priority_dataset: DEFAULT_PRIORITY_DATASET.to_string(),
            lease: Duration::from_secs(DEFAULT_LEASE_SECS as u64),
            reap_interval: Duration::from_secs(60),
            max_attempts: DEFAULT_MAX_ATTEMPTS,

            rate_cache_ttl: Duration::from_secs(300),
            rate_sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_DATABASE_URL` or `DATABASE_URL`: PostgreSQL URL (optional)
    /// - `JOBFORGE_REDIS_URL`: Redis URL for counters (optional)
    /// - `JOBFORGE_REDIS_PREFIX`: Redis key prefix (default: jobforge)
    /// - `JOBFORGE_OBJECT_ROOT`: object store root (default: ./objects)
    /// - `JOBFORGE_FOLDER_CAPACITY`: files per folder (default: 1000)
    /// - `JOBFORGE_BATCH_CAPACITY`: records per batch file (default: 1000)
    /// - `JOBFORGE_PRIORITY_DATASET`: high-priority dataset (default: variants)
    /// - `JOBFORGE_LEASE_SECS`: worker lease in seconds (default: 1800)
    /// - `JOBFORGE_REAP_INTERVAL_SECS`: reaper period in seconds (default: 60)
    /// - `JOBFORGE_MAX_ATTEMPTS`: claims before failing a job (default: 3)
    /// - `JOBFORGE_RATE_CACHE_TTL_SECS`: rate cache lifetime (default: 300)
    /// - `JOBFORGE_RATE_SAMPLE_SIZE`: completed jobs sampled (default: 100)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Storage settings
        config.database_url = std::env::var("JOBFORGE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|url| !url.is_empty());

        if let Ok(val) = std::env::var("JOBFORGE_REDIS_URL") {
            config.redis_url = Some(val).filter(|url| !url.is_empty());
        }

        if let Ok(val) = std::env::var("JOBFORGE_REDIS_PREFIX") {
            config.redis_prefix = val;
        }

        if let Ok(val) = std::env::var("JOBFORGE_OBJECT_ROOT") {
            config.object_root = PathBuf::from(val);
        }

        // Allocation settings
        if let Ok(val) = std::env::var("JOBFORGE_FOLDER_CAPACITY") {
            config.folder_capacity = parse_env_value(&val, "JOBFORGE_FOLDER_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_BATCH_CAPACITY") {
            config.batch_capacity = parse_env_value(&val, "JOBFORGE_BATCH_CAPACITY")?;
        }

        // Queue settings
        if let Ok(val) = std::env::var("JOBFORGE_PRIORITY_DATASET") {
            config.priority_dataset = val;
        }

        if let Ok(val) = std::env::var("JOBFORGE_LEASE_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_LEASE_SECS")?;
            config.lease = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_REAP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_REAP_INTERVAL_SECS")?;
            config.reap_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "JOBFORGE_MAX_ATTEMPTS")?;
        }

        // Analytics settings
        if let Ok(val) = std::env::var("JOBFORGE_RATE_CACHE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_RATE_CACHE_TTL_SECS")?;
            config.rate_cache_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_RATE_SAMPLE_SIZE") {
            config.rate_sample_size = parse_env_value(&val, "JOBFORGE_RATE_SAMPLE_SIZE")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.folder_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "folder_capacity must be greater than 0".to_string(),
            ));
        }

        if self.batch_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_capacity must be greater than 0".to_string(),
            ));
        }

        if self.priority_dataset.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "priority_dataset cannot be empty".to_string(),
            ));
        }

        if self.lease.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "lease must be at least one second".to_string(),
            ));
        }

        if self.reap_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reap_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.rate_sample_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_sample_size must be greater than 0".to_string(),
            ));
        }

        if self.redis_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the database URL or the error naming the variable to set.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("JOBFORGE_DATABASE_URL".to_string()))
    }

    /// Fails unless counters survive the process, through either Postgres
    /// or Redis.
    pub fn require_persistent_counters(&self) -> Result<(), ConfigError> {
        if self.database_url.is_none() && self.redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "JOBFORGE_DATABASE_URL or JOBFORGE_REDIS_URL".to_string(),
            ));
        }
        Ok(())
    }

    /// The lease as a signed duration for timestamp arithmetic.
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease.as_secs().min(i64::MAX as u64) as i64)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_object_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.object_root = path.into();
        self
    }

    pub fn with_folder_capacity(mut self, capacity: u64) -> Self {
        self.folder_capacity = capacity;
        self
    }

    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    pub fn with_priority_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.priority_dataset = dataset.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_rate_cache_ttl(mut self, ttl: Duration) -> Self {
        self.rate_cache_ttl = ttl;
        self
    }

    pub fn with_rate_sample_size(mut self, size: usize) -> Self {
        self.rate_sample_size = size;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
