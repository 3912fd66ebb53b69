//! Stage 4: the model's answer, checked against its source records

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
            ValidationFinding::critical(
                "HALLUCINATED_CITATION",
                format!("Response cites protocol {} which is not among its sources", code),
            )
            .with_context(json!({ "code": code }))
        })
        .collect();

    findings.extend(common::dose_findings(text, vocabulary, formulary));
    findings.extend(common::contradiction_findings(text, vocabulary, formulary));

    if let Some(gap) = common::contact_gap(text, vocabulary, formulary) {
        let shortfall = match gap {
            ContactGap::Omitted => "omits it",
            ContactGap::RuledOut => "rules it out",
        };
        for record in records.iter().filter(|r| r.base_contact_required) {
            findings.push(
                ValidationFinding::error(
                    "MISSING_BASE_CONTACT",
                    format!(
                        "Protocol {} requires base hospital contact but the response {}",
                        record.code, shortfall
                    ),
                )
                .with_context(json!({ "code": record.code, "gap": gap.as_str() })),
            );
        }
    }

    let lowered = text.to_lowercase();
    for record in records
        .iter()
        .filter(|r| !r.contraindications.is_empty())
        .filter(|r| !mentions_contraindications(&lowered, r))
    {
        findings.push(
            ValidationFinding::warning(
                "MISSING_CONTRAINDICATIONS",
                format!("Response omits the contraindications of protocol {}", record.code),
            )
            .with_context(json!({
                "code": record.code,
                "contraindications": record.contraindications,
            })),
        );
    }

    ValidationResult::from_findings(findings)
}

fn mentions_contraindications(lowered: &str, record: &ProtocolRecord) -> bool {
    lowered.contains("contraindicat")
        || record
            .contraindications
            .iter()
            .any(|c| lowered.contains(&c.to_lowercase()))
}
