//! Recovery results
//!
//! Every coordinator call returns a `RecoveryResult` describing what was
//! tried, which strategy produced the answer and how long recovery took.
//! `success` and `data` always agree for record retrieval: a successful result
//! carries data and a failed one does not.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SourceError;

/// How the answer was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// First call to the primary succeeded
    Primary,
    /// The primary succeeded after at least one retry
    Retry,
    /// The circuit was open and the call was blocked
    CircuitBreaker,
    /// A caller-supplied fallback answered
    Fallback,
    /// The warm cache answered
    Cache,
    /// The local file index answered
    FileFallback,
    /// Every tier failed; nothing is returned rather than a guess
    ConservativeDefault,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Primary => "primary",
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::CircuitBreaker => "circuit-breaker",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Cache => "cache",
            RecoveryStrategy::FileFallback => "file-fallback",
            RecoveryStrategy::ConservativeDefault => "conservative-default",
        }
    }

    /// Whether the answer came from somewhere other than the primary
    pub fn is_degraded(&self) -> bool {
        !matches!(self, RecoveryStrategy::Primary | RecoveryStrategy::Retry)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tiers the cascade can consult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackTier {
    Database,
    Cache,
    FileFallback,
}

impl FallbackTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::Database => "database",
            FallbackTier::Cache => "cache",
            FallbackTier::FileFallback => "file-fallback",
        }
    }
}

impl fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a recovery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryErrorKind {
    /// The record does not exist; not a failure of any dependency
    NotFound,
    /// The circuit breaker blocked the call
    Blocked,
    /// The dependency failed on every attempt
    Unavailable,
    /// The dependency rejected the request
    InvalidRequest,
    /// No tier could produce an answer
    Exhausted,
}

/// Caller-facing error; never contains raw driver text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryError {
    pub kind: RecoveryErrorKind,
    pub message: String,
}

impl RecoveryError {
    pub fn new(kind: RecoveryErrorKind) -> Self {
        let message = match kind {
            RecoveryErrorKind::NotFound => "protocol not found",
            RecoveryErrorKind::Blocked => "dependency temporarily blocked by circuit breaker",
            RecoveryErrorKind::Unavailable => "dependency unavailable after retries",
            RecoveryErrorKind::InvalidRequest => "request rejected by dependency",
            RecoveryErrorKind::Exhausted => "no data source could answer",
        };
        Self {
            kind,
            message: message.to_string(),
        }
    }

    /// Sanitize a source error into its caller-facing form
    pub fn from_source(err: &SourceError) -> Self {
        if err.is_transient() {
            Self::new(RecoveryErrorKind::Unavailable)
        } else {
            Self::new(RecoveryErrorKind::InvalidRequest)
        }
    }
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a resilient call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecoveryError>,
    pub strategy_used: RecoveryStrategy,
    /// Calls made to the primary dependency
    pub attempts: u32,
    /// Tiers consulted before the answering one
    pub fallbacks_used: Vec<FallbackTier>,
    pub recovery_time_ms: u64,
}

impl<T> RecoveryResult<T> {
    pub fn succeeded(data: T, strategy: RecoveryStrategy, attempts: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            strategy_used: strategy,
            attempts,
            fallbacks_used: Vec::new(),
            recovery_time_ms: 0,
        }
    }

    pub fn failed(error: RecoveryError, strategy: RecoveryStrategy, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            strategy_used: strategy,
            attempts,
            fallbacks_used: Vec::new(),
            recovery_time_ms: 0,
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<FallbackTier>) -> Self {
        self.fallbacks_used = fallbacks;
        self
    }

    pub fn with_recovery_time(mut self, ms: u64) -> Self {
        self.recovery_time_ms = ms;
        self
    }

    /// Whether any tier besides the primary was involved
    pub fn is_degraded(&self) -> bool {
        self.strategy_used.is_degraded() || !self.fallbacks_used.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RecoveryResult<U> {
        RecoveryResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            strategy_used: self.strategy_used,
            attempts: self.attempts,
            fallbacks_used: self.fallbacks_used,
            recovery_time_ms: self.recovery_time_ms,
        }
    }
}
