//! Error types for schema-warden
//!
//! The variants follow how a failure is treated by callers: configuration
//! errors are never retried, precondition errors abort the calling operation,
//! and database errors bubble up unmodified.

use thiserror::Error;

/// Main error type for schema-warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// Unsupported extension, invalid identifier or bad configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database state does not allow the requested operation
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Advisory lock bookkeeping errors
    #[error("Lock error: {0}")]
    Lock(String),

    /// A migration script failed to apply
    #[error("Migration '{name}' failed: {message}")]
    Migration { name: String, message: String },

    /// PostgreSQL driver errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Version string parsing errors
    #[error("Version error: {0}")]
    Version(#[from] semver::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Result type alias for schema-warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<anyhow::Error> for WardenError {
    fn from(err: anyhow::Error) -> Self {
        WardenError::Generic(err.to_string())
    }
}

impl From<regex::Error> for WardenError {
    fn from(err: regex::Error) -> Self {
        WardenError::Config(format!("invalid pattern: {}", err))
    }
}
