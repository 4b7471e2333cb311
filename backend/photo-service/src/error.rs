//! Error types for the photo-processing pipeline
//!
//! Split along the retry boundary: `is_transient` tells the queue layer
//! whether a retry can plausibly change the outcome. Validation and
//! processing failures are permanent; they still flow through the
//! generic attempt budget and are expected to dead-letter.

use storage_adapter::StorageError;

/// Result type for photo-service operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object storage operation failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue operation failed
    #[error("queue error: {0}")]
    Queue(String),

    /// Permanent input problem (SSRF-rejected URL, malformed watermark
    /// config, bad package request)
    #[error("validation error: {0}")]
    Validation(String),

    /// Permanent processing failure (undecodable image, encode failure)
    #[error("processing error: {0}")]
    Processing(String),

    /// Transient network failure outside storage (logo fetch timeout)
    #[error("network error: {0}")]
    Network(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Storage(e) => e.is_transient(),
            AppError::Network(_) | AppError::Database(_) | AppError::Queue(_) => true,
            AppError::Validation(_)
            | AppError::Processing(_)
            | AppError::NotFound(_)
            | AppError::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Queue(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_split() {
        assert!(AppError::Network("timeout".into()).is_transient());
        assert!(AppError::Storage(StorageError::Transient("503".into())).is_transient());
        assert!(!AppError::Storage(StorageError::NotFound("k".into())).is_transient());
        assert!(!AppError::Validation("private address".into()).is_transient());
        assert!(!AppError::Processing("undecodable".into()).is_transient());
    }
}
