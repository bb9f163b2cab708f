//! Error types for the reconciler
//!
//! One enum covers every failure the daemon can log. Nothing here is fatal to
//! the event loop: each error is logged at the point it happens and the loop
//! carries on.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for reconciler operations
pub type Result<T> = std::result::Result<T, ReconcilerError>;

/// Comprehensive error type for reconciler operations
#[derive(Error, Debug)]
pub enum ReconcilerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Git operation errors
    #[error("Git error: {0}")]
    Git(String),

    /// An operation ran past its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Sync attempt errors
    #[error("Sync error: {0}")]
    Sync(String),

    /// Signature verification refused a tag or commit
    #[error("Signature error: {0}")]
    Signature(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Git2 library errors
    #[error("Git library error: {0}")]
    Git2(#[from] git2::Error),

    /// Background job errors
    #[error("Job error: {0}")]
    Job(#[from] jobs::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl ReconcilerError {
    /// Build a timeout error for a named operation
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        ReconcilerError::Timeout { operation, after }
    }
}

impl From<tokio::task::JoinError> for ReconcilerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ReconcilerError::Other(format!("Blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = ReconcilerError::timeout("refresh", Duration::from_secs(20));
        assert_eq!(err.to_string(), "refresh timed out after 20s");
    }

    #[test]
    fn test_job_error_converts() {
        let err: ReconcilerError = jobs::Error::failed("push rejected").into();
        assert!(matches!(err, ReconcilerError::Job(_)));
        assert_eq!(err.to_string(), "Job error: job failed: push rejected");
    }
}
