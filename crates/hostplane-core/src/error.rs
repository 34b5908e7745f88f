//! Error types for Hostplane.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Cluster or container runtime unreachable after local retries.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Soft time limit exceeded, or a bounded wait ran out.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Status change rejected by the lifecycle rules or attempted outside a task.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Infrastructure faults that a retrying task category may re-drive.
    ///
    /// Business faults (not-found, conflict, validation, transition) are
    /// terminal regardless of category.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Timeout(_) | Self::Http(_) | Self::Io(_)
        )
    }

    /// Short machine-readable kind, recorded alongside task errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Validation(_) => "validation",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Database(_) => "database",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
            Self::Http(_) => "http",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_faults_not_retryable() {
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Conflict("x".into()).is_retryable());
        assert!(!Error::Validation("x".into()).is_retryable());
        assert!(!Error::InvalidTransition("x".into()).is_retryable());
    }

    #[test]
    fn test_infrastructure_faults_retryable() {
        assert!(Error::Connectivity("down".into()).is_retryable());
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert_eq!(Error::Timeout("slow".into()).kind(), "timeout");
    }
}
