//! Domain errors

use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Short machine-readable kind, used in CDR hangup causes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::Protocol(_) => "protocol_error",
            DomainError::AuthFailed(_) => "auth_failed",
            DomainError::NotFound(_) => "not_found",
            DomainError::ResourceExhausted(_) => "resource_exhausted",
            DomainError::Timeout(_) => "timeout",
            DomainError::Transient(_) => "transient",
            DomainError::Validation(_) => "validation",
            DomainError::Storage(_) => "storage",
            DomainError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound("row not found".to_string()),
            other => DomainError::Storage(other.to_string()),
        }
    }
}
