// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::port::TransportError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] crate::port::ObjectStoreError),

    #[error("Scan error: {0}")]
    Scan(#[from] crate::port::ScanError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors worth retrying at the call site (store briefly unavailable, lost CAS race)
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Conflict(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to AppError::Database(String)
