//! Health surface of the retrieval core
//!
//! Combines a live ping of the primary store with rolling call statistics,
//! breaker states, cache occupancy and local index availability.
//!
//! - **healthy**: store answering, no open circuit, fallbacks in place
//! - **degraded**: an open circuit, slow or error-prone store, or no local index
//! - **unhealthy**: the store is failing and nothing can stand in for it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use crate::breaker::BreakerSnapshot;
use crate::coordinator::{RetrievalCoordinator, StoreStatsSnapshot};
use crate::sources::SourceHealth;

/// Overall status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits used to derive the status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_latency_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            degraded_latency_ms: 1_000,
        }
    }
}

/// Point-in-time health of the retrieval core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: SourceHealth,
    pub store_stats: StoreStatsSnapshot,
    pub cache_entries: usize,
    pub open_circuits: usize,
    pub circuits: Vec<BreakerSnapshot>,
    pub local_index_available: bool,
    /// Why the status is not healthy
    pub reasons: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Inputs to status derivation, separated from I/O so it can be tested alone
#[derive(Debug, Clone)]
pub struct HealthSignals {
    pub store_reachable: bool,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub open_circuits: usize,
    pub cache_entries: usize,
    pub local_index_available: bool,
}

/// Derive the overall status and the reasons behind it
pub fn derive_status(
    signals: &HealthSignals,
    thresholds: &HealthThresholds,
) -> (HealthStatus, Vec<String>) {
    let mut reasons = Vec::new();

    if !signals.store_reachable {
        reasons.push("primary store unreachable".to_string());
    }
    if signals.open_circuits > 0 {
        reasons.push(format!("{} circuit(s) open", signals.open_circuits));
    }
    if signals.error_rate >= thresholds.degraded_error_rate {
        reasons.push(format!(
            "store error rate {:.0}%",
            signals.error_rate * 100.0
        ));
    }
    if signals.latency_ms >= thresholds.degraded_latency_ms {
        reasons.push(format!("store latency {}ms", signals.latency_ms));
    }
    if !signals.local_index_available {
        reasons.push("local index unavailable".to_string());
    }

    let store_failing =
        !signals.store_reachable || signals.error_rate >= thresholds.unhealthy_error_rate;
    let no_stand_in = !signals.local_index_available && signals.cache_entries == 0;

    let status = if store_failing && no_stand_in {
        HealthStatus::Unhealthy
    } else if reasons.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    (status, reasons)
}

impl RetrievalCoordinator {
    /// Probe the store and summarise the core's health
    pub async fn health_check(&self, thresholds: &HealthThresholds) -> HealthReport {
        let started = Instant::now();
        let ping = self.primary().ping().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let store = match &ping {
            Ok(()) => SourceHealth::healthy(self.primary().name()).with_latency(latency_ms),
            Err(e) => {
                tracing::warn!(source = self.primary().name(), error = %e, "Store health probe failed");
                SourceHealth::unhealthy(self.primary().name(), e.kind()).with_latency(latency_ms)
            }
        };

        let local_index_available = match self.local_index() {
            Some(index) => index.get().await.is_ok(),
            None => false,
        };

        let stats = self.store_stats();
        let circuits = self.breakers().snapshot();
        let open_circuits = self.breakers().open_count();
        let cache_entries = self.cache().live_count();

        let signals = HealthSignals {
            store_reachable: ping.is_ok(),
            latency_ms: latency_ms.max(stats.avg_latency_ms as u64),
            error_rate: stats.error_rate,
            open_circuits,
            cache_entries,
            local_index_available,
        };
        let (status, reasons) = derive_status(&signals, thresholds);

        tracing::debug!(status = %status, reasons = ?reasons, "Health check complete");

        HealthReport {
            status,
            store,
            store_stats: stats,
            cache_entries,
            open_circuits,
            circuits,
            local_index_available,
            reasons,
            checked_at: Utc::now(),
        }
    }
}
