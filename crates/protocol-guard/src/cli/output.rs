//! Output formatting for the CLI
//!
//! JSON, YAML and a coloured human-readable table for validation results,
//! retrieval outcomes, health reports and monitor reports.

use clap::ValueEnum;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use protocol_guard_core::{HealthReport, HealthStatus, ProtocolChunk, ProtocolRecord, RecoveryResult};

use crate::error::{GuardError, Result};
use crate::finding::{Severity, ValidationFinding, ValidationResult};
use crate::monitor::MonitorReport;

/// Output format options for CLI results
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum OutputFormat {
    /// Human-readable table format with colors
    #[default]
    Table,
    /// JSON format for machine processing
    Json,
    /// YAML format
    Yaml,
}

/// Serialize `value` as JSON or YAML; false for the table format
fn render_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<bool> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)
                .map_err(|e| GuardError::SerializationError(e.to_string()))?;
            println!("{}", json);
            Ok(true)
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(value)
                .map_err(|e| GuardError::SerializationError(e.to_string()))?;
            println!("{}", yaml);
            Ok(true)
        }
        OutputFormat::Table => Ok(false),
    }
}

fn header(stdout: &mut impl Write, title: &str) {
    writeln!(stdout).ok();
    writeln!(stdout, "{}", title.cyan().bold()).ok();
    writeln!(stdout, "{}", "=".repeat(60)).ok();
    writeln!(stdout).ok();
}

fn severity_icon(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Critical => "X".red().bold(),
        Severity::Error => "x".red(),
        Severity::Warning => "!".yellow(),
        Severity::Info => "i".blue(),
    }
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    let label = severity.as_str().to_uppercase();
    match severity {
        Severity::Critical => label.red().bold(),
        Severity::Error => label.red(),
        Severity::Warning => label.yellow(),
        Severity::Info => label.blue(),
    }
}

/// Validation output structure for rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub stage: String,
    pub valid: bool,
    /// Generated text carrying this result must not be delivered
    pub suppress: bool,
    pub critical_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub findings: Vec<ValidationFinding>,
    pub summary: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ValidationOutput {
    pub fn from_result(stage: &str, result: &ValidationResult) -> Self {
        let critical_count = result.count(Severity::Critical);
        let error_count = result.count(Severity::Error);
        let warning_count = result.count(Severity::Warning);

        let summary = if result.valid && warning_count == 0 {
            format!("{} validation passed", stage)
        } else if result.valid {
            format!("{} validation passed with {} warning(s)", stage, warning_count)
        } else {
            format!(
                "{} validation failed: {} critical, {} error(s), {} warning(s)",
                stage, critical_count, error_count, warning_count
            )
        };

        Self {
            stage: stage.to_string(),
            valid: result.valid,
            suppress: result.must_suppress(),
            critical_count,
            error_count,
            warning_count,
            info_count: result.count(Severity::Info),
            findings: result.findings.clone(),
            summary,
            metadata: result
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<()> {
        if render_structured(self, format)? {
            return Ok(());
        }
        self.render_table();
        Ok(())
    }

    fn render_table(&self) {
        let mut stdout = io::stdout();
        header(&mut stdout, "Validation Results");

        let status = if self.valid { "+".green() } else { "x".red() };
        writeln!(stdout, "{} {}", status, self.summary).ok();
        if self.suppress {
            writeln!(stdout, "  {}", "Output must not be delivered".red().bold()).ok();
        }
        writeln!(stdout).ok();

        if !self.findings.is_empty() {
            writeln!(stdout, "{}", "Findings:".cyan().bold()).ok();
            writeln!(stdout, "{}", "-".repeat(60)).ok();
            for (index, finding) in self.findings.iter().enumerate() {
                writeln!(
                    stdout,
                    "{:>3}. {} [{}] {}",
                    index + 1,
                    severity_icon(finding.severity),
                    severity_label(finding.severity),
                    finding.code.bold()
                )
                .ok();
                writeln!(stdout, "     {}", finding.message).ok();
                if let Some(context) = &finding.context {
                    writeln!(stdout, "     {}", context.to_string().dimmed()).ok();
                }
            }
            writeln!(stdout).ok();
        }

        if !self.metadata.is_empty() {
            writeln!(stdout, "{}", "Metadata:".cyan().bold()).ok();
            for (key, value) in &self.metadata {
                writeln!(stdout, "  {}: {}", key, value).ok();
            }
            writeln!(stdout).ok();
        }
    }
}

fn render_recovery_summary<T>(stdout: &mut impl Write, result: &RecoveryResult<T>) {
    let status = if !result.success {
        "x".red()
    } else if result.is_degraded() {
        "!".yellow()
    } else {
        "+".green()
    };
    writeln!(
        stdout,
        "{} strategy {} after {} attempt(s) in {} ms",
        status,
        result.strategy_used.as_str().bold(),
        result.attempts,
        result.recovery_time_ms
    )
    .ok();
    if !result.fallbacks_used.is_empty() {
        let tiers: Vec<&str> = result.fallbacks_used.iter().map(|t| t.as_str()).collect();
        writeln!(stdout, "  fallbacks: {}", tiers.join(" -> ")).ok();
    }
    if let Some(error) = &result.error {
        writeln!(stdout, "  {}", error.to_string().red()).ok();
    }
    writeln!(stdout).ok();
}

pub fn render_retrieval(result: &RecoveryResult<ProtocolRecord>, format: OutputFormat) -> Result<()> {
    if render_structured(result, format)? {
        return Ok(());
    }
    let mut stdout = io::stdout();
    header(&mut stdout, "Retrieval");
    render_recovery_summary(&mut stdout, result);

    if let Some(record) = &result.data {
        writeln!(stdout, "{} {}", record.code.bold(), record.name).ok();
        if record.base_contact_required {
            writeln!(stdout, "  {}", "Base hospital contact required".yellow()).ok();
        }
        writeln!(stdout).ok();
        writeln!(stdout, "{}", record.content).ok();
    }
    Ok(())
}

pub fn render_search(result: &RecoveryResult<Vec<ProtocolChunk>>, format: OutputFormat) -> Result<()> {
    if render_structured(result, format)? {
        return Ok(());
    }
    let mut stdout = io::stdout();
    header(&mut stdout, "Search");
    render_recovery_summary(&mut stdout, result);

    for chunk in result.data.iter().flatten() {
        writeln!(
            stdout,
            "  {:>6.2}  {}  {}",
            chunk.score,
            chunk.code.bold(),
            chunk.title
        )
        .ok();
    }
    Ok(())
}

pub fn render_health(report: &HealthReport, format: OutputFormat) -> Result<()> {
    if render_structured(report, format)? {
        return Ok(());
    }
    let mut stdout = io::stdout();
    header(&mut stdout, "Health");

    let status = match report.status {
        HealthStatus::Healthy => report.status.as_str().green(),
        HealthStatus::Degraded => report.status.as_str().yellow(),
        HealthStatus::Unhealthy => report.status.as_str().red(),
    };
    writeln!(stdout, "Status:          {}", status.bold()).ok();
    writeln!(
        stdout,
        "Store:           {} ({})",
        report.store.source,
        if report.store.healthy { "reachable" } else { "unreachable" }
    )
    .ok();
    if let Some(latency) = report.store.latency_ms {
        writeln!(stdout, "Store latency:   {} ms", latency).ok();
    }
    writeln!(
        stdout,
        "Error rate:      {:.1}% over {} call(s)",
        report.store_stats.error_rate * 100.0,
        report.store_stats.calls
    )
    .ok();
    writeln!(stdout, "Cache entries:   {}", report.cache_entries).ok();
    writeln!(stdout, "Open circuits:   {}", report.open_circuits).ok();
    writeln!(
        stdout,
        "Local index:     {}",
        if report.local_index_available { "available" } else { "unavailable" }
    )
    .ok();

    if !report.reasons.is_empty() {
        writeln!(stdout).ok();
        for reason in &report.reasons {
            writeln!(stdout, "  {} {}", "!".yellow(), reason).ok();
        }
    }
    writeln!(stdout).ok();
    Ok(())
}

pub fn render_report(report: &MonitorReport, format: OutputFormat) -> Result<()> {
    if render_structured(report, format)? {
        return Ok(());
    }
    let mut stdout = io::stdout();
    header(&mut stdout, "Validation Report");

    let metrics = &report.metrics;
    let rate = format!("{:.1}%", metrics.success_rate);
    let rate = if report.meets_target { rate.green() } else { rate.red() };
    writeln!(
        stdout,
        "Success rate: {} (target {:.1}%) over {} validation(s)",
        rate, report.success_target, metrics.total
    )
    .ok();
    writeln!(stdout, "Mean duration: {:.3} ms", metrics.avg_duration_ms).ok();
    writeln!(stdout).ok();

    if !metrics.by_stage.is_empty() {
        writeln!(stdout, "{}", "By stage:".cyan().bold()).ok();
        for (stage, stats) in &metrics.by_stage {
            writeln!(
                stdout,
                "  {:<10} {:>4} run, {:>4} failed, {:.3} ms",
                stage.as_str(),
                stats.total,
                stats.failed,
                stats.avg_duration_ms
            )
            .ok();
        }
        writeln!(stdout).ok();
    }

    if !report.patterns.is_empty() {
        writeln!(stdout, "{}", "Failure patterns:".cyan().bold()).ok();
        for pattern in &report.patterns {
            writeln!(stdout, "  {:>4}x {}", pattern.count, pattern.code.bold()).ok();
            for example in &pattern.examples {
                writeln!(stdout, "        {}", example.dimmed()).ok();
            }
        }
        writeln!(stdout).ok();
    }

    if !report.recommendations.is_empty() {
        writeln!(stdout, "{}", "Recommendations:".cyan().bold()).ok();
        for recommendation in &report.recommendations {
            writeln!(stdout, "  - {}", recommendation).ok();
        }
        writeln!(stdout).ok();
    }
    Ok(())
}
