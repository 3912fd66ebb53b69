//! Checks shared by the context and output stages

use serde_json::json;
use std::collections::BTreeSet;

use protocol_guard_core::ProtocolRecord;

use crate::extract::{self, contains_phrase, words};
use crate::finding::ValidationFinding;
use crate::formulary::{DoseCheck, Formulary};
use crate::vocabulary::Vocabulary;

/// Uppercased codes of the records handed to the stage
pub(crate) fn retrieved_codes(records: &[ProtocolRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.code.to_ascii_uppercase()).collect()
}

/// Codes cited in `text` that are not among `records`
pub(crate) fn foreign_citations(text: &str, records: &[ProtocolRecord]) -> Vec<String> {
    let known = retrieved_codes(records);
    extract::extract_protocol_codes(text)
        .into_iter()
        .filter(|code| !known.contains(code))
        .collect()
}

/// Check every dose mention in `text` against the formulary
pub(crate) fn dose_findings(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> Vec<ValidationFinding> {
    let mut findings: Vec<ValidationFinding> = Vec::new();

    for dose in extract::extract_doses(text, vocabulary, formulary) {
        let details = json!({
            "substance": dose.substance,
            "amount": dose.amount,
            "upper": dose.upper,
            "unit": dose.unit,
            "per_kg": dose.per_kg,
            "route": dose.route,
        });

        let finding = match formulary.check(&dose) {
            DoseCheck::InRange { .. } => continue,
            DoseCheck::OutOfRange { range } => {
                let mut context = details;
                context["range"] = json!(range.as_str());
                ValidationFinding::critical(
                    "DOSE_OUT_OF_RANGE",
                    format!("'{}' is outside the permitted range {}", dose.text, range),
                )
                .with_context(context)
            }
            DoseCheck::Unauthorized => ValidationFinding::critical(
                "UNAUTHORIZED_MEDICATION",
                format!("{} is not an authorized medication", dose.substance),
            )
            .with_context(details),
            DoseCheck::Unlisted => ValidationFinding::critical(
                "UNAUTHORIZED_MEDICATION",
                format!("{} is not in the formulary", dose.substance),
            )
            .with_context(details),
            DoseCheck::Unknown { reason } => ValidationFinding::warning(
                "DOSE_RANGE_UNKNOWN",
                format!("Could not verify '{}': {}", dose.text, reason),
            )
            .with_context(details),
        };

        if !findings
            .iter()
            .any(|f| f.code == finding.code && f.message == finding.message)
        {
            findings.push(finding);
        }
    }

    findings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stance {
    Affirm,
    Prohibit,
}

/// Words that open a new clause inside a sentence
const CLAUSE_BREAKS: &[&str] = &["but", "however", "whereas", "although", "though"];

/// A comma or a contrast word splits a sentence into clauses
///
/// The contrast word stays at the head of its clause so "but not" still reads
/// as a negation.
fn clauses(sentence: &str, vocabulary: &Vocabulary) -> Vec<Vec<String>> {
    let mut clauses = Vec::new();
    for piece in sentence.split(',') {
        let mut current: Vec<String> = Vec::new();
        for word in words(&extract::normalize_query(piece, vocabulary)) {
            if CLAUSE_BREAKS.contains(&word.as_str()) && !current.is_empty() {
                clauses.push(std::mem::take(&mut current));
            }
            current.push(word);
        }
        if !current.is_empty() {
            clauses.push(current);
        }
    }
    clauses
}

/// What a text instructs and prohibits, clause by clause
#[derive(Debug, Default)]
pub(crate) struct Stances {
    affirmed: Vec<String>,
    prohibited: Vec<String>,
    contact_affirmed: bool,
    contact_prohibited: bool,
}

impl Stances {
    /// Read `text` with the substances of `formulary` as subjects
    ///
    /// A negation governs the subjects after it, or every subject of its
    /// clause when none follows. A governed subject is prohibited unless a
    /// condition scopes the clause; an ungoverned one is instructed when the
    /// clause has an administration verb. Base hospital contact is a subject
    /// whenever an escalation phrase appears.
    pub(crate) fn read(text: &str, vocabulary: &Vocabulary, formulary: &Formulary) -> Self {
        let mut stances = Self::default();

        for sentence in extract::split_sentences(text) {
            let clauses = clauses(sentence, vocabulary);
            let subjects: Vec<Vec<(usize, Option<&str>)>> = clauses
                .iter()
                .map(|clause| clause_subjects(clause, vocabulary, formulary))
                .collect();
            let conditions: Vec<bool> = clauses
                .iter()
                .map(|clause| has_any(clause, &vocabulary.condition_markers))
                .collect();
            // A condition clause without subjects scopes the next clause, or
            // the previous one when it ends the sentence
            let bare = |i: usize| conditions[i] && subjects[i].is_empty();
            let last = clauses.len().saturating_sub(1);

            for (i, clause) in clauses.iter().enumerate() {
                let conditional = conditions[i]
                    || (i > 0 && bare(i - 1))
                    || (i + 1 == last && bare(last));

                let negation_end = vocabulary
                    .negation_markers
                    .iter()
                    .filter_map(|m| first_end(clause, m))
                    .min();
                let governs_all = negation_end
                    .is_some_and(|end| subjects[i].iter().all(|(start, _)| *start < end));
                let instructs = has_any(clause, &vocabulary.administration_verbs);

                for &(start, subject) in &subjects[i] {
                    let governed = negation_end.is_some_and(|end| governs_all || start >= end);
                    let stance = match (governed, conditional) {
                        (true, false) => Some(Stance::Prohibit),
                        (true, true) => None,
                        (false, _) if instructs || subject.is_none() => Some(Stance::Affirm),
                        _ => None,
                    };
                    stances.record(subject, stance);
                }
            }
        }

        stances
    }

    fn record(&mut self, subject: Option<&str>, stance: Option<Stance>) {
        match (subject, stance) {
            (Some(name), Some(Stance::Affirm)) => self.affirmed.push(name.to_string()),
            (Some(name), Some(Stance::Prohibit)) => self.prohibited.push(name.to_string()),
            (None, Some(Stance::Affirm)) => self.contact_affirmed = true,
            (None, Some(Stance::Prohibit)) => self.contact_prohibited = true,
            (_, None) => {}
        }
    }

    /// Whether some clause instructs contacting the base hospital
    pub(crate) fn contact_affirmed(&self) -> bool {
        self.contact_affirmed
    }

    /// Whether some clause rules base hospital contact out
    pub(crate) fn contact_prohibited(&self) -> bool {
        self.contact_prohibited
    }
}

fn has_any(clause: &[String], phrases: &[String]) -> bool {
    phrases.iter().any(|p| contains_phrase(clause, p))
}

/// Start of each subject in `clause`; `None` stands for base hospital contact
fn clause_subjects<'a>(
    clause: &[String],
    vocabulary: &Vocabulary,
    formulary: &'a Formulary,
) -> Vec<(usize, Option<&'a str>)> {
    let mut found: Vec<(usize, Option<&str>)> = formulary
        .known_substances()
        .filter_map(|name| first_start(clause, name).map(|start| (start, Some(name))))
        .collect();
    found.extend(
        vocabulary
            .escalation_phrases
            .iter()
            .filter_map(|phrase| first_start(clause, phrase))
            .min()
            .map(|start| (start, None)),
    );
    found
}

fn first_end(clause: &[String], phrase: &str) -> Option<usize> {
    extract::phrase_ends(clause, phrase).into_iter().min()
}

fn first_start(clause: &[String], phrase: &str) -> Option<usize> {
    let len = words(phrase).len();
    first_end(clause, phrase).map(|end| end - len)
}

/// How a text falls short of a base hospital contact requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContactGap {
    /// No clause instructs contact
    Omitted,
    /// Contact is only ever ruled out
    RuledOut,
}

impl ContactGap {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ContactGap::Omitted => "omitted",
            ContactGap::RuledOut => "ruled_out",
        }
    }
}

/// `None` when some clause of `text` instructs base hospital contact
pub(crate) fn contact_gap(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> Option<ContactGap> {
    let stances = Stances::read(text, vocabulary, formulary);
    if stances.contact_affirmed() {
        None
    } else if stances.contact_prohibited() {
        Some(ContactGap::RuledOut)
    } else {
        Some(ContactGap::Omitted)
    }
}

/// Substances (and base contact) both instructed and prohibited in `text`
pub(crate) fn contradiction_findings(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> Vec<ValidationFinding> {
    let Stances {
        affirmed,
        prohibited,
        contact_affirmed,
        contact_prohibited,
    } = Stances::read(text, vocabulary, formulary);

    let mut seen = BTreeSet::new();
    let mut findings: Vec<ValidationFinding> = affirmed
        .iter()
        .filter(|s| prohibited.contains(s) && seen.insert(s.as_str()))
        .map(|substance| {
            ValidationFinding::error(
                "RESPONSE_CONTRADICTIONS",
                format!("Response both instructs and prohibits {}", substance),
            )
            .with_context(json!({ "substance": substance }))
        })
        .collect();

    if contact_affirmed && contact_prohibited {
        findings.push(
            ValidationFinding::error(
                "RESPONSE_CONTRADICTIONS",
                "Response both requires and rules out base hospital contact",
            )
            .with_context(json!({ "subject": "base_contact" })),
        );
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_prohibition_is_not_a_contradiction() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Administer midazolam 5 mg IM. If systolic pressure is below 90, do not give midazolam.";
        assert!(contradiction_findings(text, &vocabulary, &formulary).is_empty());
    }

    #[test]
    fn test_base_contact_contradiction() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Contact base hospital before transport. Base hospital contact is not required.";
        let findings = contradiction_findings(text, &vocabulary, &formulary);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].context, Some(json!({ "subject": "base_contact" })));
    }

    #[test]
    fn test_contradiction_within_one_sentence() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Administer midazolam 2 mg IV, but do not administer midazolam.";
        let findings = contradiction_findings(text, &vocabulary, &formulary);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].context, Some(json!({ "substance": "midazolam" })));
    }

    #[test]
    fn test_negation_only_covers_what_follows_it() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Give midazolam 5 mg IM and not ketamine. Repeat midazolam 5 mg IM once.";
        assert!(contradiction_findings(text, &vocabulary, &formulary).is_empty());

        let stances = Stances::read(text, &vocabulary, &formulary);
        assert_eq!(stances.prohibited, vec!["ketamine"]);
        assert!(stances.affirmed.iter().all(|s| s == "midazolam"));
    }

    #[test]
    fn test_trailing_condition_scopes_prohibition() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Give midazolam 5 mg IM. Do not give midazolam, if systolic pressure is below 90.";
        assert!(contradiction_findings(text, &vocabulary, &formulary).is_empty());
    }

    #[test]
    fn test_contact_gap() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let gap = |text: &str| contact_gap(text, &vocabulary, &formulary);

        assert_eq!(gap("Contact base hospital for repeat doses."), None);
        assert_eq!(gap("BHC before transport."), None);
        assert_eq!(gap("Transport to the nearest facility."), Some(ContactGap::Omitted));
        assert_eq!(
            gap("Base hospital contact is not required."),
            Some(ContactGap::RuledOut)
        );
        assert_eq!(gap("Do not contact base hospital."), Some(ContactGap::RuledOut));
    }

    #[test]
    fn test_unlisted_substance_is_critical() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let findings = dose_findings("Administer morphine 4 mg IV.", &vocabulary, &formulary);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "UNAUTHORIZED_MEDICATION");
        assert_eq!(findings[0].message, "morphine is not in the formulary");
    }

    #[test]
    fn test_repeated_dose_reported_once() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let text = "Epinephrine 5 mg IV. Repeat epinephrine 5 mg IV.";
        let findings = dose_findings(text, &vocabulary, &formulary);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "DOSE_OUT_OF_RANGE");
    }

    #[test]
    fn test_foreign_citations_ignore_case() {
        let records = vec![ProtocolRecord::new("1210-P", "Cardiac Arrest (Pediatric)", "...")];
        assert!(foreign_citations("per 1210-p", &records).is_empty());
        assert_eq!(foreign_citations("per 1211", &records), vec!["1211"]);
    }
}
