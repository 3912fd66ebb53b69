//! Validation monitor
//!
//! Keeps a bounded history of validation outcomes and a frequency map of
//! blocking finding codes, and derives success rates and reports from them.
//! Old events fall off the front of the ring buffers; pattern counts are
//! kept for the life of the monitor.

use chrono::{DateTime, Duration as TimeWindow, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::finding::{Severity, ValidationResult, ValidationStage};

/// Failures kept in a report
const REPORT_RECENT_FAILURES: usize = 10;

/// Monitor sizing and targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub event_capacity: usize,
    pub failure_capacity: usize,
    /// Example messages kept per finding code
    pub max_examples: usize,
    /// Operational success target, in percent
    pub success_target: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 10_000,
            failure_capacity: 1_000,
            max_examples: 5,
            success_target: 99.0,
        }
    }
}

/// One recorded validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEvent {
    pub timestamp: DateTime<Utc>,
    pub stage: ValidationStage,
    pub result: ValidationResult,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Occurrences of one blocking finding code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub code: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub total: usize,
    pub failed: usize,
    pub avg_duration_ms: f64,
}

/// Aggregates over the events in a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorMetrics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percent of successful validations; 100 when nothing was recorded
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub by_stage: BTreeMap<ValidationStage, StageMetrics>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<i64>,
}

/// Point-in-time summary for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: MonitorMetrics,
    pub success_target: f64,
    pub meets_target: bool,
    pub patterns: Vec<ErrorPattern>,
    pub recent_failures: Vec<ValidationEvent>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct MonitorState {
    events: VecDeque<ValidationEvent>,
    failures: VecDeque<ValidationEvent>,
    patterns: HashMap<String, ErrorPattern>,
}

/// Records validation outcomes for operational visibility
#[derive(Debug)]
pub struct ValidationMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl Default for ValidationMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ValidationMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_validation(
        &self,
        stage: ValidationStage,
        result: &ValidationResult,
        duration: Duration,
        query: Option<String>,
    ) {
        self.record_validation_at(stage, result, duration, query, Utc::now())
    }

    pub fn record_validation_at(
        &self,
        stage: ValidationStage,
        result: &ValidationResult,
        duration: Duration,
        query: Option<String>,
        now: DateTime<Utc>,
    ) {
        let event = ValidationEvent {
            timestamp: now,
            stage,
            result: result.clone(),
            duration_ms: duration.as_nanos() as f64 / 1_000_000.0,
            query,
        };

        let mut state = self.state();

        for finding in result.errors() {
            let pattern = state
                .patterns
                .entry(finding.code.clone())
                .or_insert_with(|| ErrorPattern {
                    code: finding.code.clone(),
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                    examples: Vec::new(),
                });
            pattern.count += 1;
            pattern.last_seen = now;
            if pattern.examples.len() < self.config.max_examples
                && !pattern.examples.contains(&finding.message)
            {
                pattern.examples.push(finding.message.clone());
            }
        }

        if !result.valid {
            if state.failures.len() >= self.config.failure_capacity {
                state.failures.pop_front();
            }
            state.failures.push_back(event.clone());
        }

        if state.events.len() >= self.config.event_capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    /// Aggregates over all retained events, or those inside `window`
    pub fn metrics(&self, window: Option<TimeWindow>) -> MonitorMetrics {
        self.metrics_at(window, Utc::now())
    }

    pub fn metrics_at(&self, window: Option<TimeWindow>, now: DateTime<Utc>) -> MonitorMetrics {
        let state = self.state();
        let events: Vec<&ValidationEvent> = state
            .events
            .iter()
            .filter(|e| in_window(e, window, now))
            .collect();

        let total = events.len();
        let successful = events.iter().filter(|e| e.result.valid).count();
        let success_rate = if total == 0 {
            100.0
        } else {
            successful as f64 / total as f64 * 100.0
        };

        let mut by_stage: BTreeMap<ValidationStage, StageMetrics> = BTreeMap::new();
        let mut findings_by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
        for event in &events {
            let stage = by_stage.entry(event.stage).or_default();
            stage.total += 1;
            if !event.result.valid {
                stage.failed += 1;
            }
            // running sum for now, divided below
            stage.avg_duration_ms += event.duration_ms;

            for finding in &event.result.findings {
                *findings_by_severity.entry(finding.severity).or_default() += 1;
            }
        }
        for stage in by_stage.values_mut() {
            stage.avg_duration_ms /= stage.total as f64;
        }

        MonitorMetrics {
            total,
            successful,
            failed: total - successful,
            success_rate,
            avg_duration_ms: mean(events.iter().map(|e| e.duration_ms)),
            by_stage,
            findings_by_severity,
            window_minutes: window.map(|w| w.num_minutes()),
        }
    }

    /// Blocking finding codes seen at least `min_frequency` times, most frequent first
    pub fn patterns(&self, min_frequency: u64) -> Vec<ErrorPattern> {
        let state = self.state();
        let mut patterns: Vec<ErrorPattern> = state
            .patterns
            .values()
            .filter(|p| p.count >= min_frequency)
            .cloned()
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
        patterns
    }

    pub fn meets_success_target(&self, target_percent: f64, window: Option<TimeWindow>) -> bool {
        self.metrics(window).success_rate >= target_percent
    }

    /// Most recent failures, newest last
    pub fn recent_failures(&self, limit: usize) -> Vec<ValidationEvent> {
        let state = self.state();
        let skip = state.failures.len().saturating_sub(limit);
        state.failures.iter().skip(skip).cloned().collect()
    }

    pub fn generate_report(&self, window: Option<TimeWindow>) -> MonitorReport {
        self.generate_report_at(window, Utc::now())
    }

    pub fn generate_report_at(
        &self,
        window: Option<TimeWindow>,
        now: DateTime<Utc>,
    ) -> MonitorReport {
        let metrics = self.metrics_at(window, now);
        let target = self.config.success_target;
        let meets_target = metrics.success_rate >= target;
        let patterns = self.patterns(1);
        let recent_failures: Vec<ValidationEvent> = self
            .recent_failures(REPORT_RECENT_FAILURES)
            .into_iter()
            .filter(|e| in_window(e, window, now))
            .collect();
        let recommendations = recommendations(&metrics, target, &patterns);

        if !meets_target {
            tracing::warn!(
                success_rate = metrics.success_rate,
                target,
                total = metrics.total,
                "Validation success rate below target"
            );
        }

        MonitorReport {
            generated_at: now,
            metrics,
            success_target: target,
            meets_target,
            patterns,
            recent_failures,
            recommendations,
        }
    }

    /// Drop all history
    pub fn clear(&self) {
        let mut state = self.state();
        state.events.clear();
        state.failures.clear();
        state.patterns.clear();
    }
}

fn in_window(event: &ValidationEvent, window: Option<TimeWindow>, now: DateTime<Utc>) -> bool {
    window.map_or(true, |w| event.timestamp >= now - w)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn recommendations(metrics: &MonitorMetrics, target: f64, patterns: &[ErrorPattern]) -> Vec<String> {
    let mut out = Vec::new();

    if metrics.success_rate < target {
        out.push(format!(
            "Success rate {:.1}% is below the {:.1}% target",
            metrics.success_rate, target
        ));
    }

    for pattern in patterns.iter().take(3) {
        let advice = match pattern.code.as_str() {
            "HALLUCINATED_CITATION" | "UNRETRIEVED_CITATION" => {
                "restrict the model to citing retrieved protocols"
            }
            "DOSE_OUT_OF_RANGE" | "UNAUTHORIZED_MEDICATION" => {
                "review dose wording in the context and the formulary table"
            }
            "MISSING_BASE_CONTACT" => "surface base hospital contact requirements in the context",
            "RESPONSE_CONTRADICTIONS" => "review the prompt for conflicting instructions",
            "DEPRECATED_PROTOCOL" | "PROTOCOL_EXPIRED" | "INCOMPLETE_PROTOCOL" => {
                "refresh the protocol store and local index"
            }
            "INVALID_PROTOCOL_CODE" => "check the protocol code list offered to users",
            _ => "investigate recent examples",
        };
        out.push(format!("{} seen {} times: {}", pattern.code, pattern.count, advice));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::ValidationFinding;

    fn failing(code: &str) -> ValidationResult {
        ValidationResult::from_findings(vec![ValidationFinding::critical(code, format!("{} example", code))])
    }

    #[test]
    fn test_empty_monitor_meets_target() {
        let monitor = ValidationMonitor::default();
        let metrics = monitor.metrics(None);
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.success_rate, 100.0);
        assert!(monitor.meets_success_target(99.0, None));
    }

    #[test]
    fn test_success_rate() {
        let monitor = ValidationMonitor::default();
        let ok = ValidationResult::default();
        for _ in 0..3 {
            monitor.record_validation(ValidationStage::Output, &ok, Duration::from_millis(2), None);
        }
        monitor.record_validation(
            ValidationStage::Output,
            &failing("HALLUCINATED_CITATION"),
            Duration::from_millis(6),
            None,
        );

        let metrics = monitor.metrics(None);
        assert_eq!(metrics.success_rate, 75.0);
        assert_eq!(metrics.avg_duration_ms, 3.0);
        assert_eq!(metrics.by_stage[&ValidationStage::Output].failed, 1);
        assert_eq!(metrics.findings_by_severity[&Severity::Critical], 1);
        assert!(!monitor.meets_success_target(99.0, None));
    }

    #[test]
    fn test_ring_buffers_are_bounded() {
        let monitor = ValidationMonitor::new(MonitorConfig {
            event_capacity: 5,
            failure_capacity: 2,
            ..MonitorConfig::default()
        });
        for _ in 0..8 {
            monitor.record_validation(
                ValidationStage::Context,
                &failing("MISSING_BASE_CONTACT"),
                Duration::ZERO,
                None,
            );
        }
        assert_eq!(monitor.metrics(None).total, 5);
        assert_eq!(monitor.recent_failures(10).len(), 2);
        assert_eq!(monitor.patterns(1)[0].count, 8);
    }

    #[test]
    fn test_patterns_keep_few_distinct_examples() {
        let monitor = ValidationMonitor::default();
        for i in 0..10 {
            let result = ValidationResult::from_findings(vec![ValidationFinding::error(
                "UNRETRIEVED_CITATION",
                format!("cites {}", 1200 + i % 7),
            )]);
            monitor.record_validation(ValidationStage::Context, &result, Duration::ZERO, None);
        }
        let patterns = monitor.patterns(10);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].examples.len(), 5);
        assert!(monitor.patterns(11).is_empty());
    }

    #[test]
    fn test_warnings_do_not_form_patterns() {
        let monitor = ValidationMonitor::default();
        let result = ValidationResult::from_findings(vec![ValidationFinding::warning("VAGUE_QUERY", "vague")]);
        monitor.record_validation(ValidationStage::Query, &result, Duration::ZERO, Some("help".into()));
        assert!(monitor.patterns(1).is_empty());
        assert_eq!(monitor.metrics(None).successful, 1);
    }

    #[test]
    fn test_window_excludes_old_events() {
        let monitor = ValidationMonitor::default();
        let now = Utc::now();
        monitor.record_validation_at(
            ValidationStage::Output,
            &failing("DOSE_OUT_OF_RANGE"),
            Duration::ZERO,
            None,
            now - TimeWindow::hours(2),
        );
        monitor.record_validation_at(
            ValidationStage::Output,
            &ValidationResult::default(),
            Duration::ZERO,
            None,
            now,
        );

        let recent = monitor.metrics_at(Some(TimeWindow::minutes(60)), now);
        assert_eq!(recent.total, 1);
        assert_eq!(recent.success_rate, 100.0);
        assert_eq!(recent.window_minutes, Some(60));

        let report = monitor.generate_report_at(Some(TimeWindow::minutes(60)), now);
        assert!(report.meets_target);
        assert!(report.recent_failures.is_empty());

        let report = monitor.generate_report_at(None, now);
        assert!(!report.meets_target);
        assert_eq!(report.recent_failures.len(), 1);
        assert!(report.recommendations[0].contains("below"));
        assert!(report.recommendations[1].starts_with("DOSE_OUT_OF_RANGE seen 1 times"));
    }
}
