//! Error types for davlock

use thiserror::Error;

/// Result type alias using davlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// davlock error types with helpful messages and suggestions
///
/// Conflicts, unknown state tokens and out-of-range unlocks are not errors;
/// they are reported through the outcome types of the lock manager.
#[derive(Error, Debug)]
pub enum Error {
    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Corrupted lock record: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E700-E799)
    #[error("Operation cancelled before commit")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "E400",
            Self::Corrupted(_) => "E401",
            Self::Serialization(_) => "E402",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9998",
            Self::Other(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::DatabaseError(_) => Some("Check the lock database path with `davlock config get storage.path`".to_string()),
            Self::Corrupted(_) => Some("davlock purge".to_string()),
            Self::ConfigError(_) => Some("davlock config list".to_string()),
            _ => None,
        }
    }

    /// Whether the failure came from the persistence backend
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::Corrupted(_) | Self::Serialization(_) | Self::Io(_)
        )
    }
}
