//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Row or schema shape does not match the database schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Numeric value out of range for the target column type
    #[error("Value out of range: {0}")]
    TypeRange(String),

    /// Query validation failed
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query was cancelled before completion
    #[error("Query cancelled")]
    Cancelled,
}

impl EmberError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, EmberError::Corruption(_))
    }

    /// Check if error is a caller-side validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EmberError::SchemaMismatch(_) | EmberError::TypeRange(_) | EmberError::InvalidQuery(_)
        )
    }
}
