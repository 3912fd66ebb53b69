//! Stage 1: the user's query, before it is dispatched

use serde_json::json;

use protocol_guard_core::ProtocolSource;

use crate::extract::{self, words};
use crate::finding::{ValidationFinding, ValidationResult};
use crate::formulary::Formulary;
use crate::vocabulary::Vocabulary;

/// Queries with this many meaningful words or fewer are too vague
const MIN_MEANINGFUL_TOKENS: usize = 3;

pub(crate) async fn check(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
    lookup: &dyn ProtocolSource,
) -> ValidationResult {
    let normalized = extract::normalize_query(text, vocabulary);
    let codes = extract::extract_protocol_codes(&normalized);
    let medications = extract::extract_substances(&normalized, vocabulary, formulary);
    let mut findings = Vec::new();

    for code in &codes {
        match lookup.exists(code).await {
            Ok(true) => {}
            Ok(false) => findings.push(
                ValidationFinding::error(
                    "INVALID_PROTOCOL_CODE",
                    format!("Protocol {} does not exist", code),
                )
                .with_context(json!({ "code": code })),
            ),
            Err(e) => {
                tracing::warn!(code = %code, error = %e, "Protocol lookup failed during query validation");
                findings.push(
                    ValidationFinding::warning(
                        "PROTOCOL_LOOKUP_UNAVAILABLE",
                        format!("Could not verify that protocol {} exists", code),
                    )
                    .with_context(json!({ "code": code, "kind": e.kind() })),
                );
            }
        }
    }

    let meaningful: Vec<String> = words(&normalized)
        .into_iter()
        .filter(|w| !vocabulary.is_stop_word(w))
        .collect();
    let vague = meaningful.iter().filter(|w| vocabulary.is_vague(w)).count();
    if meaningful.len() <= MIN_MEANINGFUL_TOKENS || vague * 2 >= meaningful.len() {
        findings.push(
            ValidationFinding::warning(
                "VAGUE_QUERY",
                "Query is too vague to match a specific protocol",
            )
            .with_context(json!({
                "meaningful_tokens": meaningful.len(),
                "vague_tokens": vague,
            })),
        );
    }

    for medication in medications.iter().filter(|m| formulary.is_unauthorized(m)) {
        findings.push(
            ValidationFinding::warning(
                "UNAUTHORIZED_MEDICATION_QUERY",
                format!("{} is not in the authorized formulary", medication),
            )
            .with_context(json!({ "medication": medication })),
        );
    }

    if !medications.is_empty() && codes.is_empty() {
        findings.push(ValidationFinding::warning(
            "MEDICATION_WITHOUT_PROTOCOL",
            "Medication question does not reference a protocol",
        ));
    }

    ValidationResult::from_findings(findings)
        .with_metadata("normalized_query", json!(normalized))
        .with_metadata("protocol_codes", json!(codes))
        .with_metadata("medications", json!(medications))
}
