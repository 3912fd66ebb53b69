//! Stage 3: the context assembled for the model

use serde_json::json;

use protocol_guard_core::ProtocolRecord;

use super::common::{self, ContactGap};
use crate::finding::{ValidationFinding, ValidationResult};
use crate::formulary::Formulary;
use crate::vocabulary::Vocabulary;

pub(crate) fn check(
    text: &str,
    records: &[ProtocolRecord],
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> ValidationResult {
    let mut findings: Vec<ValidationFinding> = common::foreign_citations(text, records)
        .into_iter()
        .map(|code| {
            ValidationFinding::error(
                "UNRETRIEVED_CITATION",
                format!("Context cites protocol {} which was not retrieved", code),
            )
            .with_context(json!({ "code": code }))
        })
        .collect();

    findings.extend(common::dose_findings(text, vocabulary, formulary));

    let requiring: Vec<&str> = records
        .iter()
        .filter(|r| r.base_contact_required)
        .map(|r| r.code.as_str())
        .collect();
    if !requiring.is_empty() {
        if let Some(gap) = common::contact_gap(text, vocabulary, formulary) {
            let message = match gap {
                ContactGap::Omitted => "Context omits the base hospital contact requirement",
                ContactGap::RuledOut => "Context rules out the base hospital contact its protocols require",
            };
            findings.push(
                ValidationFinding::error("MISSING_BASE_CONTACT", message)
                    .with_context(json!({ "protocols": requiring, "gap": gap.as_str() })),
            );
        }
    }

    ValidationResult::from_findings(findings)
}
