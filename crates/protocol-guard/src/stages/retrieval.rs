//! Stage 2: records returned by retrieval

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;

use protocol_guard_core::ProtocolRecord;

use crate::finding::{ValidationFinding, ValidationResult};

/// Shorter content than this cannot be a usable protocol
const MIN_CONTENT_CHARS: usize = 50;

pub(crate) fn check(records: &[ProtocolRecord], now: DateTime<Utc>) -> ValidationResult {
    if records.is_empty() {
        return ValidationResult::from_findings(vec![ValidationFinding::warning(
            "NO_PROTOCOLS_RETRIEVED",
            "No protocols were retrieved for this query",
        )]);
    }

    let mut findings = Vec::new();
    for record in records {
        findings.extend(record_findings(record, now));
    }

    let requiring: Vec<&str> = records
        .iter()
        .filter(|r| r.base_contact_required)
        .map(|r| r.code.as_str())
        .collect();
    if !requiring.is_empty() && requiring.len() < records.len() {
        findings.push(
            ValidationFinding::warning(
                "PROTOCOL_CONFLICTS",
                "Retrieved protocols disagree on whether base hospital contact is required",
            )
            .with_context(json!({ "conflict": "base_contact", "requiring": requiring })),
        );
    }

    let mut current: BTreeMap<String, usize> = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_current) {
        *current.entry(record.code.to_ascii_uppercase()).or_default() += 1;
    }
    for (code, versions) in current.into_iter().filter(|(_, n)| *n > 1) {
        findings.push(
            ValidationFinding::warning(
                "PROTOCOL_CONFLICTS",
                format!("{} current versions of protocol {} were retrieved", versions, code),
            )
            .with_context(json!({ "conflict": "duplicate_current", "code": code })),
        );
    }

    ValidationResult::from_findings(findings)
        .with_metadata("records", json!(records.len()))
}

fn record_findings(record: &ProtocolRecord, now: DateTime<Utc>) -> Vec<ValidationFinding> {
    let code = record.code.as_str();
    let mut findings = Vec::new();

    if !record.is_current {
        findings.push(
            ValidationFinding::critical(
                "DEPRECATED_PROTOCOL",
                format!("Protocol {} has been superseded", code),
            )
            .with_context(json!({ "code": code })),
        );
    }

    if record.effective_date > now {
        findings.push(
            ValidationFinding::error(
                "PROTOCOL_NOT_EFFECTIVE",
                format!(
                    "Protocol {} is not effective until {}",
                    code,
                    record.effective_date.to_rfc3339()
                ),
            )
            .with_context(json!({ "code": code, "effective_date": record.effective_date })),
        );
    }

    if let Some(expired) = record.expiration_date.filter(|exp| *exp <= now) {
        findings.push(
            ValidationFinding::critical(
                "PROTOCOL_EXPIRED",
                format!("Protocol {} expired on {}", code, expired.to_rfc3339()),
            )
            .with_context(json!({ "code": code, "expiration_date": expired })),
        );
    }

    let length = record.content.trim().chars().count();
    if length < MIN_CONTENT_CHARS {
        findings.push(
            ValidationFinding::critical(
                "INCOMPLETE_PROTOCOL",
                format!("Protocol {} content is too short to be complete", code),
            )
            .with_context(json!({ "code": code, "length": length })),
        );
    }

    if record.name.trim().is_empty() {
        findings.push(
            ValidationFinding::error(
                "MISSING_PROTOCOL_NAME",
                format!("Protocol {} has no name", code),
            )
            .with_context(json!({ "code": code })),
        );
    }

    if !record.warnings.is_empty() {
        findings.push(
            ValidationFinding::warning(
                "CRITICAL_WARNINGS_PRESENT",
                format!("Protocol {} carries warnings that must be surfaced", code),
            )
            .with_context(json!({ "code": code, "warnings": record.warnings })),
        );
    }

    findings
}
