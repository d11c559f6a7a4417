//! Error types for file API operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileApiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Rejected by target: {path}: {reason}")]
    RejectedByTarget { path: String, reason: String },

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Delta fail-safe triggered: too many remote deletions")]
    FailSafe,

    #[error("Invalid delta context: {0}")]
    BadContext(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FileApiError {
    /// Transient transport failures that should not surface in user-facing
    /// error reports.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FileApiError::Timeout(_) | FileApiError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, FileApiError>;
