//! Error types for jobforge operations.
//!
//! Defines the error types shared across the engine:
//! - Storage failures from the document store and object store
//! - Job queue input validation
//! - Sequential and batch path allocation
//! - ID64 parsing
//! - Configuration loading
//!
//! A job that cannot be found is never an error here. Dequeue returns
//! `Ok(None)` and terminal reports return `ReportOutcome::NotFound`.

use thiserror::Error;

/// Failures of the shared document store or object store.
///
/// These are carried through every layer untranslated so that a worker can
/// retry the whole operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record with the same key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored record could not be decoded into its expected shape.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors that can occur while parsing a formatted ID64.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("Invalid ID64 length: expected 19 characters, got {0}")]
    InvalidLength(usize),

    #[error("Invalid ID64 separator at position {0}")]
    InvalidSeparator(usize),

    #[error("Invalid ID64 hex digits: {0}")]
    InvalidHex(String),
}

/// Errors that can occur during sequential or batch path allocation.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("Invalid allocation input: {0}")]
    InvalidInput(String),

    #[error("Batch file '{path}' is malformed: {message}")]
    BatchFormat { path: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that can occur during job queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid job id: {0}")]
    Id(#[from] IdParseError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Returns true when the error came from the storage layer and the whole
    /// operation may be retried.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            QueueError::Store(_) | QueueError::Allocator(AllocatorError::Store(_))
        )
    }
}

/// Errors that can occur while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
