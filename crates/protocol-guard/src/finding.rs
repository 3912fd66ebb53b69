//! Validation findings and results
//!
//! A finding is data: the pipeline never aborts on one. Callers decide what
//! to do with the result, with `ValidationResult::must_suppress` marking the
//! cases where generated text must not be delivered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity level for validation findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - no action required
    Info,
    /// Warning - worth surfacing, never blocking
    Warning,
    /// Error - the answer should be rewritten or withheld
    Error,
    /// Critical - the answer must not reach the user
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of the pipeline a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    /// Before the query is dispatched
    Query,
    /// After records are retrieved
    Retrieval,
    /// Before the model's input context is sent
    Context,
    /// After the model produced its answer
    Output,
}

impl ValidationStage {
    pub const ALL: [ValidationStage; 4] = [
        ValidationStage::Query,
        ValidationStage::Retrieval,
        ValidationStage::Context,
        ValidationStage::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::Query => "query",
            ValidationStage::Retrieval => "retrieval",
            ValidationStage::Context => "context",
            ValidationStage::Output => "output",
        }
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single issue detected during validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    /// Stable machine-readable code, e.g. `HALLUCINATED_CITATION`
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ValidationFinding {
    pub fn new(code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            context: None,
        }
    }

    pub fn critical(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Critical, message)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Info, message)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Error or critical
    pub fn is_blocking(&self) -> bool {
        matches!(self.severity, Severity::Error | Severity::Critical)
    }
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
    }
}

/// Ordered findings of one stage plus stage metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True when no finding is an error or critical
    pub valid: bool,
    pub findings: Vec<ValidationFinding>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::from_findings(Vec::new())
    }
}

impl ValidationResult {
    pub fn from_findings(findings: Vec<ValidationFinding>) -> Self {
        let valid = !findings.iter().any(ValidationFinding::is_blocking);
        Self {
            valid,
            findings,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Critical and error findings
    pub fn errors(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings.iter().filter(|f| f.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }

    /// Generated text carrying this result must be discarded
    pub fn must_suppress(&self) -> bool {
        self.has_critical()
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings().next().is_some()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn codes(&self) -> Vec<&str> {
        self.findings.iter().map(|f| f.code.as_str()).collect()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_validity_derivation() {
        let warnings_only = ValidationResult::from_findings(vec![ValidationFinding::warning(
            "VAGUE_QUERY",
            "too vague",
        )]);
        assert!(warnings_only.valid);
        assert!(warnings_only.has_warnings());
        assert!(!warnings_only.must_suppress());

        let with_error = ValidationResult::from_findings(vec![ValidationFinding::error(
            "MISSING_BASE_CONTACT",
            "no base contact",
        )]);
        assert!(!with_error.valid);
        assert!(!with_error.must_suppress());
        assert_eq!(with_error.errors().count(), 1);

        let with_critical = ValidationResult::from_findings(vec![ValidationFinding::critical(
            "HALLUCINATED_CITATION",
            "cites 9999",
        )]);
        assert!(with_critical.must_suppress());
    }

    #[test]
    fn test_finding_display() {
        let finding = ValidationFinding::critical("DOSE_OUT_OF_RANGE", "epinephrine 5 mg");
        assert_eq!(
            finding.to_string(),
            "[critical] DOSE_OUT_OF_RANGE: epinephrine 5 mg"
        );
    }

    #[test]
    fn test_serialization_skips_empty() {
        let json = serde_json::to_value(ValidationResult::default()).unwrap();
        assert_eq!(json, serde_json::json!({"valid": true, "findings": []}));
    }
}
