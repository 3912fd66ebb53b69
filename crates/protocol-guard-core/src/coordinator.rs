//! Tiered retrieval coordinator
//!
//! Wraps the primary protocol store in retry-with-backoff and circuit breaker
//! protection, then cascades through the warm cache and the local index.
//!
//! ```text
//! START -> TRY_PRIMARY -> SUCCESS
//!                      -> TRY_CACHE -> SUCCESS
//!                                   -> TRY_FILE -> SUCCESS
//!                                               -> FAIL (no data)
//! ```
//!
//! A clean "not found" from the primary ends the cascade immediately: the
//! store is authoritative about which codes exist, and older copies of a
//! withdrawn protocol must not be served.
//!
//! # Example
//!
//! ```rust,ignore
//! use protocol_guard_core::{RetrievalCoordinator, FileIndexLoader};
//!
//! let coordinator = RetrievalCoordinator::builder(store)
//!     .local_index(FileIndexLoader::new("protocols.json"))
//!     .build();
//!
//! let result = coordinator.retrieve_with_fallback("1210").await;
//! if let Some(record) = result.data {
//!     println!("{} via {}", record.name, result.strategy_used);
//! }
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::audit::{AuditEmitter, AuditRecord};
use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::cache::{CacheConfig, ProtocolCache};
use crate::config::CoreConfig;
use crate::error::{SourceError, SourceResult};
use crate::model::{ProtocolChunk, ProtocolRecord, SearchOptions};
use crate::recovery::{
    FallbackTier, RecoveryError, RecoveryErrorKind, RecoveryResult, RecoveryStrategy,
};
use crate::sources::{LazyLocalIndex, LocalIndexLoader, ProtocolSource};

/// Retrieval tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Attempts against the primary store (first call plus retries)
    pub primary_max_attempts: u32,
    /// Delay before the first retry, in milliseconds; doubles per retry
    pub primary_base_delay_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Randomise each delay to between half and all of its nominal value
    pub jitter: bool,
    /// Circuit breaker key used for the primary store
    pub database_key: String,
    /// Number of recent primary calls kept for health statistics
    pub stats_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            primary_max_attempts: 3,
            primary_base_delay_ms: 500,
            max_backoff_ms: 30_000,
            jitter: false,
            database_key: "database".to_string(),
            stats_window: 100,
        }
    }
}

impl RetrievalConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.primary_base_delay_ms)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.primary_max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.primary_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CallSample {
    latency_ms: u64,
    ok: bool,
}

/// Rolling statistics of primary store calls
#[derive(Debug)]
pub struct StoreStats {
    window: usize,
    samples: Mutex<VecDeque<CallSample>>,
}

/// Summary of recent primary store calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub calls: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

impl StoreStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, latency_ms: u64, ok: bool) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(CallSample { latency_ms, ok });
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        let calls = samples.len();
        if calls == 0 {
            return StoreStatsSnapshot::default();
        }
        let errors = samples.iter().filter(|s| !s.ok).count();
        let total_latency: u64 = samples.iter().map(|s| s.latency_ms).sum();
        StoreStatsSnapshot {
            calls,
            errors,
            error_rate: errors as f64 / calls as f64,
            avg_latency_ms: total_latency as f64 / calls as f64,
        }
    }
}

/// Resilient protocol retrieval
///
/// Constructed once by the host's composition root and shared through `Arc`.
#[derive(Debug)]
pub struct RetrievalCoordinator {
    primary: Arc<dyn ProtocolSource>,
    local_index: Option<LazyLocalIndex>,
    cache: ProtocolCache,
    breakers: CircuitBreakerRegistry,
    stats: StoreStats,
    config: RetrievalConfig,
    audit: Option<AuditEmitter>,
}

/// Builder for `RetrievalCoordinator`
pub struct RetrievalCoordinatorBuilder {
    primary: Arc<dyn ProtocolSource>,
    local_index: Option<LazyLocalIndex>,
    config: RetrievalConfig,
    breaker_config: BreakerConfig,
    cache_config: CacheConfig,
    audit: Option<AuditEmitter>,
}

impl RetrievalCoordinatorBuilder {
    /// Lazily loaded local index consulted after the cache
    pub fn local_index<L: LocalIndexLoader + 'static>(mut self, loader: L) -> Self {
        self.local_index = Some(LazyLocalIndex::new(Arc::new(loader)));
        self
    }

    /// Already-built local index
    pub fn local_source(mut self, source: Arc<dyn ProtocolSource>) -> Self {
        self.local_index = Some(LazyLocalIndex::ready(source));
        self
    }

    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Take retrieval, breaker and cache settings from one config
    pub fn core_config(self, config: &CoreConfig) -> Self {
        self.config(config.retrieval.clone())
            .breaker_config(config.breaker.clone())
            .cache_config(config.cache.clone())
    }

    pub fn audit(mut self, emitter: AuditEmitter) -> Self {
        self.audit = Some(emitter);
        self
    }

    pub fn build(self) -> RetrievalCoordinator {
        RetrievalCoordinator {
            primary: self.primary,
            local_index: self.local_index,
            cache: ProtocolCache::new(&self.cache_config),
            breakers: CircuitBreakerRegistry::new(self.breaker_config),
            stats: StoreStats::new(self.config.stats_window),
            config: self.config,
            audit: self.audit,
        }
    }
}

impl RetrievalCoordinator {
    pub fn builder(primary: Arc<dyn ProtocolSource>) -> RetrievalCoordinatorBuilder {
        RetrievalCoordinatorBuilder {
            primary,
            local_index: None,
            config: RetrievalConfig::default(),
            breaker_config: BreakerConfig::default(),
            cache_config: CacheConfig::default(),
            audit: None,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn cache(&self) -> &ProtocolCache {
        &self.cache
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn store_stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn primary(&self) -> &Arc<dyn ProtocolSource> {
        &self.primary
    }

    pub fn local_index(&self) -> Option<&LazyLocalIndex> {
        self.local_index.as_ref()
    }

    /// Delay applied after `completed` failed attempts
    fn backoff_delay(&self, base_delay: Duration, completed: u32) -> Duration {
        let factor = 2u32.saturating_pow(completed.saturating_sub(1));
        let nominal = base_delay
            .saturating_mul(factor)
            .min(Duration::from_millis(self.config.max_backoff_ms));
        if self.config.jitter {
            nominal.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            nominal
        }
    }

    /// Run `operation` up to `max_attempts` times with exponential backoff
    ///
    /// Permanent errors end the loop early. Only the calling task sleeps.
    pub async fn retry_with_backoff<T, F, Fut>(
        &self,
        mut operation: F,
        max_attempts: u32,
        base_delay: Duration,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        let start = Instant::now();
        let max_attempts = max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error: Option<SourceError> = None;

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.backoff_delay(base_delay, attempts);
                tracing::debug!(
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    let strategy = if attempts == 1 {
                        RecoveryStrategy::Primary
                    } else {
                        RecoveryStrategy::Retry
                    };
                    return RecoveryResult::succeeded(value, strategy, attempts)
                        .with_recovery_time(elapsed_ms(start));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = max_attempts,
                        error_kind = e.kind(),
                        error = %e,
                        elapsed_ms = elapsed_ms(start),
                        "Operation failed"
                    );
                    let permanent = !e.is_transient();
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
        }

        let error = last_error
            .as_ref()
            .map(RecoveryError::from_source)
            .unwrap_or_else(|| RecoveryError::new(RecoveryErrorKind::Unavailable));
        let strategy = if attempts > 1 {
            RecoveryStrategy::Retry
        } else {
            RecoveryStrategy::Primary
        };
        RecoveryResult::failed(error, strategy, attempts).with_recovery_time(elapsed_ms(start))
    }

    /// Run `operation` behind the circuit breaker for `key`
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        self.execute_guarded(
            key,
            operation,
            None::<fn() -> std::future::Ready<SourceResult<T>>>,
        )
        .await
    }

    /// Like `execute_with_circuit_breaker`, running `fallback` when the
    /// circuit is open or the operation fails
    pub async fn execute_with_circuit_breaker_or<T, F, Fut, G, GFut>(
        &self,
        key: &str,
        operation: F,
        fallback: G,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = SourceResult<T>>,
    {
        self.execute_guarded(key, operation, Some(fallback)).await
    }

    async fn execute_guarded<T, F, Fut, G, GFut>(
        &self,
        key: &str,
        operation: F,
        fallback: Option<G>,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = SourceResult<T>>,
    {
        let start = Instant::now();

        if self.breakers.is_open(key) {
            tracing::warn!(key = key, "Circuit open, skipping primary call");
            return match fallback {
                Some(fallback) => run_fallback(key, fallback, 0, start).await,
                None => RecoveryResult::failed(
                    RecoveryError::new(RecoveryErrorKind::Blocked),
                    RecoveryStrategy::CircuitBreaker,
                    0,
                )
                .with_recovery_time(elapsed_ms(start)),
            };
        }

        match operation().await {
            Ok(value) => {
                self.breakers.record_success(key);
                RecoveryResult::succeeded(value, RecoveryStrategy::Primary, 1)
                    .with_recovery_time(elapsed_ms(start))
            }
            Err(e) => {
                // A rejected request still means the dependency answered
                if e.is_transient() {
                    self.breakers.record_failure(key);
                } else {
                    self.breakers.record_success(key);
                }
                tracing::warn!(key = key, error_kind = e.kind(), error = %e, "Guarded call failed");
                match fallback {
                    Some(fallback) => run_fallback(key, fallback, 1, start).await,
                    None => RecoveryResult::failed(
                        RecoveryError::from_source(&e),
                        RecoveryStrategy::Primary,
                        1,
                    )
                    .with_recovery_time(elapsed_ms(start)),
                }
            }
        }
    }

    /// Primary call with breaker, retries and latency statistics
    async fn guarded_primary<T, F, Fut>(&self, mut operation: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        let key = self.config.database_key.as_str();
        if self.breakers.is_open(key) {
            tracing::warn!(key = key, "Circuit open, primary store skipped");
            return RecoveryResult::failed(
                RecoveryError::new(RecoveryErrorKind::Blocked),
                RecoveryStrategy::CircuitBreaker,
                0,
            );
        }

        let result = self
            .retry_with_backoff(
                || {
                    let call = operation();
                    async move {
                        let started = Instant::now();
                        let outcome = call.await;
                        self.stats.record(elapsed_ms(started), outcome.is_ok());
                        outcome
                    }
                },
                self.config.primary_max_attempts,
                self.config.base_delay(),
            )
            .await;

        let store_failed = result
            .error
            .as_ref()
            .is_some_and(|e| e.kind == RecoveryErrorKind::Unavailable);
        if store_failed {
            self.breakers.record_failure(key);
        } else {
            self.breakers.record_success(key);
        }
        result
    }

    /// Fetch a protocol through the full cascade
    #[tracing::instrument(skip(self))]
    pub async fn retrieve_with_fallback(&self, code: &str) -> RecoveryResult<ProtocolRecord> {
        let start = Instant::now();
        let mut fallbacks = Vec::new();

        let primary = self
            .guarded_primary(|| self.primary.get_record_by_code(code))
            .await;
        let attempts = primary.attempts;

        if primary.success {
            let result = match primary.data.flatten() {
                Some(record) => {
                    self.cache.insert(record.clone());
                    RecoveryResult::succeeded(record, primary.strategy_used, attempts)
                }
                None => RecoveryResult::failed(
                    RecoveryError::new(RecoveryErrorKind::NotFound),
                    primary.strategy_used,
                    attempts,
                ),
            };
            return self.finish_retrieval(code, result, start);
        }
        fallbacks.push(FallbackTier::Database);

        if let Some(record) = self.cache.get(code) {
            tracing::info!(code = code, "Serving protocol from cache");
            let result = RecoveryResult::succeeded(record, RecoveryStrategy::Cache, attempts)
                .with_fallbacks(fallbacks);
            return self.finish_retrieval(code, result, start);
        }
        fallbacks.push(FallbackTier::Cache);

        if let Some(index) = &self.local_index {
            match index.get().await {
                Ok(source) => match source.get_record_by_code(code).await {
                    Ok(Some(record)) => {
                        tracing::info!(code = code, "Serving protocol from local index");
                        self.cache.insert(record.clone());
                        let result = RecoveryResult::succeeded(
                            record,
                            RecoveryStrategy::FileFallback,
                            attempts,
                        )
                        .with_fallbacks(fallbacks);
                        return self.finish_retrieval(code, result, start);
                    }
                    Ok(None) => tracing::debug!(code = code, "Local index has no match"),
                    Err(e) => tracing::warn!(code = code, error = %e, "Local index lookup failed"),
                },
                Err(e) => tracing::warn!(error = %e, "Local index unavailable"),
            }
            fallbacks.push(FallbackTier::FileFallback);
        }

        let result = RecoveryResult::failed(
            RecoveryError::new(RecoveryErrorKind::Exhausted),
            RecoveryStrategy::ConservativeDefault,
            attempts,
        )
        .with_fallbacks(fallbacks);
        self.finish_retrieval(code, result, start)
    }

    /// Search through primary store then local index
    ///
    /// An empty primary result is an answer. On exhaustion the result is a
    /// failure carrying an explicit empty list.
    #[tracing::instrument(skip(self, options))]
    pub async fn search_with_fallback(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> RecoveryResult<Vec<ProtocolChunk>> {
        let start = Instant::now();

        let primary = self
            .guarded_primary(|| self.primary.search_records(query, options))
            .await;
        let attempts = primary.attempts;
        if primary.success {
            return self.finish_search(query, primary.with_recovery_time(elapsed_ms(start)));
        }

        let mut fallbacks = vec![FallbackTier::Database];
        if let Some(index) = &self.local_index {
            match index.get().await {
                Ok(source) => match source.search_records(query, options).await {
                    Ok(hits) if !hits.is_empty() => {
                        let result =
                            RecoveryResult::succeeded(hits, RecoveryStrategy::FileFallback, attempts)
                                .with_fallbacks(fallbacks)
                                .with_recovery_time(elapsed_ms(start));
                        return self.finish_search(query, result);
                    }
                    Ok(_) => tracing::debug!("Local index returned no hits"),
                    Err(e) => tracing::warn!(error = %e, "Local index search failed"),
                },
                Err(e) => tracing::warn!(error = %e, "Local index unavailable"),
            }
            fallbacks.push(FallbackTier::FileFallback);
        }

        let mut result = RecoveryResult::failed(
            RecoveryError::new(RecoveryErrorKind::Exhausted),
            RecoveryStrategy::ConservativeDefault,
            attempts,
        )
        .with_fallbacks(fallbacks)
        .with_recovery_time(elapsed_ms(start));
        result.data = Some(Vec::new());
        self.finish_search(query, result)
    }

    fn finish_retrieval(
        &self,
        code: &str,
        result: RecoveryResult<ProtocolRecord>,
        start: Instant,
    ) -> RecoveryResult<ProtocolRecord> {
        let result = result.with_recovery_time(elapsed_ms(start));
        let fallbacks: Vec<&str> = result.fallbacks_used.iter().map(|t| t.as_str()).collect();

        if result.success {
            tracing::debug!(
                code = code,
                strategy = %result.strategy_used,
                attempts = result.attempts,
                fallbacks = ?fallbacks,
                elapsed_ms = result.recovery_time_ms,
                "Protocol retrieved"
            );
        } else {
            tracing::warn!(
                code = code,
                strategy = %result.strategy_used,
                attempts = result.attempts,
                fallbacks = ?fallbacks,
                elapsed_ms = result.recovery_time_ms,
                error = ?result.error.as_ref().map(|e| e.kind),
                "Protocol retrieval failed"
            );
        }

        self.emit_audit("retrieve_with_fallback", code, &result);
        result
    }

    fn finish_search(
        &self,
        query: &str,
        result: RecoveryResult<Vec<ProtocolChunk>>,
    ) -> RecoveryResult<Vec<ProtocolChunk>> {
        tracing::debug!(
            strategy = %result.strategy_used,
            attempts = result.attempts,
            hits = result.data.as_ref().map_or(0, Vec::len),
            elapsed_ms = result.recovery_time_ms,
            success = result.success,
            "Search finished"
        );
        self.emit_audit("search_with_fallback", query, &result);
        result
    }

    fn emit_audit<T>(&self, operation: &str, subject: &str, result: &RecoveryResult<T>) {
        if let Some(audit) = &self.audit {
            let record = AuditRecord::new(
                operation,
                serde_json::json!({
                    "success": result.success,
                    "strategy_used": result.strategy_used,
                    "attempts": result.attempts,
                    "fallbacks_used": result.fallbacks_used,
                    "recovery_time_ms": result.recovery_time_ms,
                    "error": result.error,
                }),
            )
            .with_subject(subject);
            audit.emit(record);
        }
    }
}

async fn run_fallback<T, G, GFut>(
    key: &str,
    fallback: G,
    attempts: u32,
    start: Instant,
) -> RecoveryResult<T>
where
    G: FnOnce() -> GFut,
    GFut: Future<Output = SourceResult<T>>,
{
    match fallback().await {
        Ok(value) => RecoveryResult::succeeded(value, RecoveryStrategy::Fallback, attempts)
            .with_recovery_time(elapsed_ms(start)),
        Err(e) => {
            tracing::warn!(key = key, error = %e, "Fallback failed");
            RecoveryResult::failed(
                RecoveryError::new(RecoveryErrorKind::Exhausted),
                RecoveryStrategy::Fallback,
                attempts,
            )
            .with_recovery_time(elapsed_ms(start))
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
