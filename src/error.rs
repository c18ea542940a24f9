use thiserror::Error;

use crate::document::JobId;

/// Error type returned by user hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lock service error: {0}")]
    LockService(String),

    #[error("Job handler failed: {0}")]
    Handler(BoxError),

    #[error("Job handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Invalid recurrence rule: {0}")]
    Recurrence(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CronError {
    /// True for errors raised by user code rather than by the store or lock service.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, CronError::Handler(_) | CronError::HandlerPanicked(_))
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
