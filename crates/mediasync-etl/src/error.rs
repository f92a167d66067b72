//! ETL error types

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::Retryable;

/// Result type alias for ETL operations
pub type EtlResult<T> = std::result::Result<T, EtlError>;

/// Errors raised while synchronizing content into the search index
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search index returned {status}: {message}")]
    Index { status: u16, message: String },

    #[error("Checkpoint store is corrupt: {0}")]
    StateCorrupt(String),

    #[error("No checkpoint found and one is required: {0}")]
    MissingCheckpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoder failed with exit code {code:?}: {message}")]
    Encoder { code: Option<i32>, message: String },

    #[error("Failed to remove {}: {source}", path.display())]
    Cleanup { path: PathBuf, source: std::io::Error },

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl EtlError {
    /// Whether the error is a connectivity fault worth retrying.
    ///
    /// Data errors (bad rows, encoder exits, corrupt checkpoints) are never
    /// transient: repeating them cannot change the outcome.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            EtlError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
            },
            EtlError::Index { status, .. } => is_transient_status(*status),
            EtlError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

impl Retryable for EtlError {
    fn is_transient(&self) -> bool {
        EtlError::is_transient(self)
    }
}
