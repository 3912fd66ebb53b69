//! Resilient protocol retrieval
//!
//! This crate fetches protocol records through a degrading chain of sources
//! while tolerating partial failures of the primary store:
//!
//! - **Circuit breakers** per dependency key, with lazy open/half-open/closed transitions
//! - **Retry with exponential backoff**, skipping permanent errors
//! - **Warm cache** with per-entry TTL
//! - **Local index** loaded once on first use
//! - **Audit emission** of retrieval outcomes through a non-blocking queue
//! - **Health reporting** derived from live probes and rolling statistics
//!
//! Every component is `Send + Sync` and meant to be shared through `Arc`.

pub mod audit;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod model;
pub mod recovery;
pub mod sources;

pub use audit::{AuditEmitter, AuditRecord, AuditSink, AuditWorker, JsonlAuditSink, TracingAuditSink};
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use cache::{CacheConfig, ProtocolCache};
pub use config::CoreConfig;
pub use coordinator::{RetrievalConfig, RetrievalCoordinator, RetrievalCoordinatorBuilder, StoreStatsSnapshot};
pub use error::{AuditError, ConfigError, SourceError, SourceResult};
pub use health::{HealthReport, HealthStatus, HealthThresholds};
pub use model::{ProtocolChunk, ProtocolRecord, SearchOptions};
pub use recovery::{FallbackTier, RecoveryError, RecoveryErrorKind, RecoveryResult, RecoveryStrategy};
pub use sources::{FileIndexLoader, FileProtocolIndex, LazyLocalIndex, LocalIndexLoader, ProtocolSource, SourceHealth};
