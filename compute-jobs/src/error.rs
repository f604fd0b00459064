//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid job specification: {0}")]
    InvalidSpecification(String),

    #[error("Unknown scheduler: {0}")]
    UnknownScheduler(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Operation '{operation}' not allowed for job {id} in status {status}")]
    InvalidState {
        id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Scheduler '{scheduler}' is at capacity ({limit} concurrent jobs)")]
    CapacityExceeded { scheduler: String, limit: u32 },

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Backend temporarily unavailable: {0}")]
    PollRetryable(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Version conflict on job {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::InvalidSpecification(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_state(
        id: impl ToString,
        status: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            status: status.to_string(),
            operation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
