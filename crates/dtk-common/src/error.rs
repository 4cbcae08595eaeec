//! Error types and result handling for driftkit

use thiserror::Error;

/// Result type alias for driftkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for driftkit operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Alert error: {0}")]
    Alert(String),

    #[error("Metric '{0}' is locked by another run")]
    Locked(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Check if the error is transient (safe to retry on the next run)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Timeout(_))
    }

    /// Process exit code for this error: 2 for configuration errors,
    /// 1 for everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 2,
            _ => 1,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Database(_) => "database",
            Error::Query(_) => "query",
            Error::InvalidTimestamp(_) => "timestamp",
            Error::Load(_) => "load",
            Error::Detection(_) => "detection",
            Error::Alert(_) => "alert",
            Error::Locked(_) => "locked",
            Error::Timeout(_) => "timeout",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Generic(_) => "generic",
        }
    }
}
