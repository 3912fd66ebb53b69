//! Prometheus metrics for validation and retrieval
//!
//! - `protocol_guard_validations_total` (counter) - validations by stage and result
//! - `protocol_guard_findings_total` (counter) - findings by stage, severity and code
//! - `protocol_guard_validation_duration_seconds` (histogram) - stage duration
//! - `protocol_guard_retrievals_total` (counter) - retrievals by strategy and result
//! - `protocol_guard_open_circuits` (gauge) - circuits currently open
//!
//! # Example
//!
//! ```rust,no_run
//! use protocol_guard::metrics::GuardMetrics;
//!
//! let metrics = GuardMetrics::new().unwrap();
//! metrics.record_retrieval("cache", true);
//! println!("{}", metrics.encode_text().unwrap());
//! ```

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

use protocol_guard_core::{RecoveryResult, RetrievalCoordinator};

use crate::error::{GuardError, Result};
use crate::finding::{ValidationResult, ValidationStage};

const NAMESPACE: &str = "protocol_guard";

/// Validation and retrieval metrics registered in one Prometheus registry
pub struct GuardMetrics {
    registry: Arc<Registry>,

    /// Validations by stage and result (valid, invalid)
    validations_total: CounterVec,

    /// Findings by stage, severity and code
    findings_total: CounterVec,

    /// Stage duration in seconds
    duration_seconds: HistogramVec,

    /// Retrievals by strategy and result
    retrievals_total: CounterVec,

    open_circuits: Gauge,
}

impl std::fmt::Debug for GuardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardMetrics").finish_non_exhaustive()
    }
}

impl GuardMetrics {
    /// Create metrics in a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create metrics and register them with an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let validations_total = CounterVec::new(
            Opts::new("validations_total", "Total number of validations by stage and result")
                .namespace(NAMESPACE),
            &["stage", "result"],
        )?;

        let findings_total = CounterVec::new(
            Opts::new("findings_total", "Total number of validation findings")
                .namespace(NAMESPACE),
            &["stage", "severity", "code"],
        )?;

        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "validation_duration_seconds",
                "Validation stage duration in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["stage"],
        )?;

        let retrievals_total = CounterVec::new(
            Opts::new("retrievals_total", "Total number of protocol retrievals by strategy")
                .namespace(NAMESPACE),
            &["strategy", "result"],
        )?;

        let open_circuits = Gauge::with_opts(
            Opts::new("open_circuits", "Number of circuit breakers currently open")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(validations_total.clone()))?;
        registry.register(Box::new(findings_total.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(retrievals_total.clone()))?;
        registry.register(Box::new(open_circuits.clone()))?;

        Ok(Self {
            registry,
            validations_total,
            findings_total,
            duration_seconds,
            retrievals_total,
            open_circuits,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Record one stage result
    pub fn record_validation(
        &self,
        stage: ValidationStage,
        result: &ValidationResult,
        duration: Duration,
    ) {
        let outcome = if result.valid { "valid" } else { "invalid" };
        self.validations_total
            .with_label_values(&[stage.as_str(), outcome])
            .inc();
        self.duration_seconds
            .with_label_values(&[stage.as_str()])
            .observe(duration.as_secs_f64());
        for finding in &result.findings {
            self.findings_total
                .with_label_values(&[stage.as_str(), finding.severity.as_str(), &finding.code])
                .inc();
        }
    }

    pub fn record_retrieval(&self, strategy: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.retrievals_total
            .with_label_values(&[strategy, result])
            .inc();
    }

    /// Record a coordinator outcome and refresh the open circuit gauge
    pub fn observe_recovery<T>(
        &self,
        result: &RecoveryResult<T>,
        coordinator: &RetrievalCoordinator,
    ) {
        self.record_retrieval(result.strategy_used.as_str(), result.success);
        self.observe_circuits(coordinator);
    }

    pub fn observe_circuits(&self, coordinator: &RetrievalCoordinator) {
        self.open_circuits
            .set(coordinator.breakers().open_count() as f64);
    }

    pub fn retrievals(&self, strategy: &str, success: bool) -> f64 {
        let result = if success { "success" } else { "failure" };
        self.retrievals_total
            .with_label_values(&[strategy, result])
            .get()
    }

    pub fn open_circuits(&self) -> f64 {
        self.open_circuits.get()
    }

    pub fn validations(&self, stage: ValidationStage, valid: bool) -> f64 {
        let outcome = if valid { "valid" } else { "invalid" };
        self.validations_total
            .with_label_values(&[stage.as_str(), outcome])
            .get()
    }

    pub fn findings(&self, stage: ValidationStage, severity: &str, code: &str) -> f64 {
        self.findings_total
            .with_label_values(&[stage.as_str(), severity, code])
            .get()
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode metrics as text for scraping
    pub fn encode_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| GuardError::InternalError(e.to_string()))
    }
}
