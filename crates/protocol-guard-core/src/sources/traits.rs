//! Core traits for protocol sources
//!
//! The primary store and the local fallback index share the same shape so the
//! coordinator can cascade from one to the other.
//!
//! # Error Handling
//!
//! A missing record is `Ok(None)` (or `Ok(false)` for `exists`), never an
//! error. `Err(SourceError)` is reserved for infrastructure failures; the
//! coordinator retries those and never retries a clean miss.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::SourceResult;
use crate::model::{ProtocolChunk, ProtocolRecord, SearchOptions};

/// A queryable source of protocol records
#[async_trait]
pub trait ProtocolSource: Send + Sync + fmt::Debug {
    /// Returns the unique name of this source
    fn name(&self) -> &str;

    /// Fetch the current record with the given code
    ///
    /// Returns `Ok(None)` when the code is unknown to this source.
    async fn get_record_by_code(&self, code: &str) -> SourceResult<Option<ProtocolRecord>>;

    /// Search for protocol chunks matching a free-text query
    ///
    /// An empty vector is a legitimate answer, not a failure.
    async fn search_records(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> SourceResult<Vec<ProtocolChunk>>;

    /// Check whether a code exists without returning the record
    ///
    /// Default implementation fetches the record.
    async fn exists(&self, code: &str) -> SourceResult<bool> {
        Ok(self.get_record_by_code(code).await?.is_some())
    }

    /// Cheap liveness probe used by the health surface
    async fn ping(&self) -> SourceResult<()> {
        Ok(())
    }
}

/// Builds the local fallback index on first use
#[async_trait]
pub trait LocalIndexLoader: Send + Sync + fmt::Debug {
    /// Name of the index being loaded
    fn name(&self) -> &str;

    /// Load the index; may be slow
    async fn load(&self) -> SourceResult<Arc<dyn ProtocolSource>>;
}

/// Memoised lazily-initialised local index
///
/// The first successful `load` is kept for the lifetime of the process.
/// Concurrent first callers wait on the same initialisation. A failed load
/// leaves the cell empty so a later call can try again.
#[derive(Debug)]
pub struct LazyLocalIndex {
    loader: Arc<dyn LocalIndexLoader>,
    cell: OnceCell<Arc<dyn ProtocolSource>>,
}

impl LazyLocalIndex {
    pub fn new(loader: Arc<dyn LocalIndexLoader>) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already-built index; it is ready immediately
    pub fn ready(source: Arc<dyn ProtocolSource>) -> Self {
        Self {
            loader: Arc::new(PreloadedIndex(Arc::clone(&source))),
            cell: OnceCell::new_with(Some(source)),
        }
    }

    /// Whether initialisation already completed
    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    pub fn name(&self) -> &str {
        self.loader.name()
    }

    /// Get the index, initialising it if needed
    pub async fn get(&self) -> SourceResult<&Arc<dyn ProtocolSource>> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!(index = self.loader.name(), "Initialising local protocol index");
                self.loader.load().await
            })
            .await
    }
}

#[derive(Debug)]
struct PreloadedIndex(Arc<dyn ProtocolSource>);

#[async_trait]
impl LocalIndexLoader for PreloadedIndex {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn load(&self) -> SourceResult<Arc<dyn ProtocolSource>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Health status for a source
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceHealth {
    /// Source name
    pub source: String,
    /// Whether the probe succeeded
    pub healthy: bool,
    /// Optional status message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Probe round-trip time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl SourceHealth {
    pub fn healthy(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            healthy: true,
            message: None,
            latency_ms: None,
        }
    }

    pub fn unhealthy(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            healthy: false,
            message: Some(message.into()),
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
}
