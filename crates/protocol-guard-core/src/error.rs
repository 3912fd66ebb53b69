//! Error types for the retrieval core
//!
//! Source errors describe infrastructure failures of the primary store or the
//! local index. They are logged in full but never forwarded verbatim to
//! callers: `RecoveryResult` carries a sanitized `RecoveryError` instead.

use thiserror::Error;

/// Errors that can occur when talking to a protocol source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The source is not available or not configured
    #[error("Source not available: {0}")]
    Unavailable(String),

    /// Rate limiting or throttling
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The request itself was rejected (bad code format, bad query)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Loading or parsing source data failed
    #[error("Data error: {0}")]
    DataError(String),

    /// Generic source error
    #[error("Source error: {0}")]
    Other(String),
}

impl SourceError {
    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout(_)
                | SourceError::ConnectionError(_)
                | SourceError::Unavailable(_)
                | SourceError::RateLimited(_)
                | SourceError::Other(_)
        )
    }

    /// Short machine-readable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Timeout(_) => "timeout",
            SourceError::ConnectionError(_) => "connection",
            SourceError::Unavailable(_) => "unavailable",
            SourceError::RateLimited(_) => "rate_limited",
            SourceError::InvalidRequest(_) => "invalid_request",
            SourceError::DataError(_) => "data",
            SourceError::Other(_) => "other",
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::DataError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for SourceError {
    fn from(err: serde_yaml::Error) -> Self {
        SourceError::DataError(format!("YAML error: {}", err))
    }
}

/// Result type for source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Audit emission errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to serialize audit record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write audit record: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit queue closed")]
    QueueClosed,

    #[error("Audit sink error: {0}")]
    Sink(String),
}
