//! Error types for the validation crate
//!
//! Validation findings are data, not errors. These types cover loading
//! tables and inputs, metrics registration and CLI plumbing.

use protocol_guard_core::{ConfigError, SourceError};
use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum GuardError {
    /// Invalid input data or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File access or I/O error
    #[error("File error: {0}")]
    FileError(String),

    /// Input or table parsing error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A protocol source failed outside the retrieval cascade
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Prometheus registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Output serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GuardError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        GuardError::InvalidInput(msg.into())
    }

    pub fn file_error(msg: impl Into<String>) -> Self {
        GuardError::FileError(msg.into())
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        GuardError::ParseError(msg.into())
    }

    /// Check if this is a user-facing error (vs internal)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GuardError::InvalidInput(_)
                | GuardError::FileError(_)
                | GuardError::ParseError(_)
                | GuardError::Config(_)
        )
    }

    /// Whether the error came from reading a file
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            GuardError::FileError(_) | GuardError::Config(ConfigError::Io(_))
        )
    }
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        GuardError::FileError(err.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::ParseError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for GuardError {
    fn from(err: serde_yaml::Error) -> Self {
        GuardError::ParseError(format!("YAML error: {}", err))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::InvalidInput("empty query".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty query");
    }

    #[test]
    fn test_is_user_error() {
        assert!(GuardError::invalid_input("x").is_user_error());
        assert!(GuardError::file_error("x").is_user_error());
        assert!(GuardError::parse_error("x").is_user_error());
        assert!(!GuardError::InternalError("x".to_string()).is_user_error());
        assert!(!GuardError::Source(SourceError::Timeout("x".into())).is_user_error());
    }

    #[test]
    fn test_file_error_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(GuardError::Config(ConfigError::Io(io)).is_file_error());
        assert!(!GuardError::parse_error("x").is_file_error());
    }
}
