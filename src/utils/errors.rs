//! Custom error types for the backup daemon.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage API error: {0}")]
    Api(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Replication to {host} failed: {detail}")]
    Replication { host: String, detail: String },
}

impl BackupError {
    /// Transient errors clear on their own: the next tick or poll retries
    /// them, and only repeated occurrences flip the health endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Http(_) | BackupError::Api(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
