//! Circuit breaker for dependency protection
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls are blocked
//! - Half-Open: a bounded number of probe calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed    -> Open:      failure_count reaches threshold
//! Open      -> Half-Open: reset_timeout elapsed since the last failure (checked in is_open)
//! Half-Open -> Closed:    success_threshold probe successes
//! Half-Open -> Open:      any probe failure
//! ```
//!
//! Transitions are computed lazily when the breaker is consulted; there is no
//! timer task. Every time-dependent method has an `_at` variant taking the
//! current instant so tests can drive the clock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// Time after the last failure before probing, in milliseconds
    pub reset_timeout_ms: u64,
    /// Probe calls admitted while half-open
    pub half_open_requests: u32,
    /// Probe successes needed to close again
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_requests: 3,
            success_threshold: 1,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests.max(1);
        self
    }
}

/// A single circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probes_admitted: u32,
    probe_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            probes_admitted: 0,
            probe_successes: 0,
        }
    }

    /// Whether calls must currently be blocked
    pub fn is_open(&mut self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout() {
                    self.state = CircuitState::HalfOpen;
                    self.probes_admitted = 1;
                    self.probe_successes = 0;
                    tracing::info!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Circuit half-open, admitting probe"
                    );
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if self.probes_admitted < self.config.half_open_requests {
                    self.probes_admitted += 1;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        if self.state == CircuitState::HalfOpen {
            self.probe_successes += 1;
            if self.probe_successes >= self.config.success_threshold {
                self.close();
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        match self.state {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed if self.failure_count >= self.config.threshold => self.open(),
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Operator reset back to a pristine closed breaker
    pub fn reset(&mut self) {
        self.close();
        self.last_failure = None;
    }

    fn open(&mut self) {
        tracing::warn!(failures = self.failure_count, "Circuit opened");
        self.state = CircuitState::Open;
        self.probes_admitted = 0;
        self.probe_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.probes_admitted = 0;
        self.probe_successes = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Per-key breakers, created lazily
///
/// Each breaker has its own mutex so callers on unrelated keys never contend.
/// Locks are never held across an await point.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Get or create the breaker for `key`
    pub fn breaker(&self, key: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone()))));
        Arc::clone(entry.value())
    }

    pub fn is_open(&self, key: &str) -> bool {
        lock(&self.breaker(key)).is_open()
    }

    pub fn record_success(&self, key: &str) {
        lock(&self.breaker(key)).record_success();
    }

    pub fn record_failure(&self, key: &str) {
        lock(&self.breaker(key)).record_failure();
    }

    pub fn state(&self, key: &str) -> CircuitState {
        lock(&self.breaker(key)).state()
    }

    /// Reset one breaker; unknown keys are ignored
    pub fn reset(&self, key: &str) {
        if let Some(breaker) = self.breakers.get(key) {
            lock(breaker.value()).reset();
            tracing::info!(key = key, "Circuit breaker reset by operator");
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            lock(entry.value()).reset();
        }
    }

    /// Number of breakers currently open
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|e| lock(e.value()).state() == CircuitState::Open)
            .count()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|e| {
                let breaker = lock(e.value());
                BreakerSnapshot {
                    key: e.key().clone(),
                    state: breaker.state(),
                    failure_count: breaker.failure_count(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

pub(crate) fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
