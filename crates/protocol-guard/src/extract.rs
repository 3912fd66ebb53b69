//! Extraction helpers shared by the validation stages
//!
//! A small tokenizer plus table lookups: protocol codes and dose amounts are
//! found with regular expressions, substance names and phrases are matched
//! word by word against the vocabulary and formulary tables.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::formulary::{DoseUnit, Formulary, Route};
use crate::vocabulary::Vocabulary;

/// Four digits plus an optional `-P` (pediatric) or `.N` suffix
static PROTOCOL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{4})(-P|\.\d{1,2})?\b").expect("valid protocol code regex"));

/// Amount (or amount range), unit, optional per-kg and optional route
static DOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d+(?:\.\d+)?)(?:\s*(?:-|to)\s*(\d+(?:\.\d+)?))?\s*(mcg|µg|ug|mg|gm?|grams?|ml|units?|meq)(\s*(?:/|per)\s*kg)?\b(?:\s*(?:(iv/io|ivp|iv|io|im|po|sl|et|neb(?:ulized)?|sq|subq|intravenous(?:ly)?|intramuscular(?:ly)?|intranasal(?:ly)?|sublingual(?:ly)?|orally|oral)\b|(?-i:(IN))\b))?",
    )
    .expect("valid dose regex")
});

static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[!?;\n]+|\.(?:\s+|$)").expect("valid sentence regex"));

/// Words examined on each side of a dose when looking for its substance
const SUBSTANCE_WINDOW_BEFORE: usize = 8;
const SUBSTANCE_WINDOW_AFTER: usize = 3;

/// A substance + amount + unit (+ route) found in text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseMention {
    pub substance: String,
    pub amount: f64,
    /// Upper end when the text gives a range such as "2-5 mg"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    pub unit: DoseUnit,
    pub per_kg: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Matched text, for messages
    pub text: String,
}

impl DoseMention {
    pub fn amounts(&self) -> impl Iterator<Item = f64> {
        std::iter::once(self.amount).chain(self.upper)
    }
}

/// Lowercase words, apostrophes kept so "don't" stays one word
pub fn words(text: &str) -> Vec<String> {
    text.replace('\u{2019}', "'")
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Word index just past each occurrence of `phrase`
pub(crate) fn phrase_ends(haystack: &[String], phrase: &str) -> Vec<usize> {
    let needle = words(phrase);
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle.as_slice())
        .map(|(i, _)| i + needle.len())
        .collect()
}

pub fn contains_phrase(haystack: &[String], phrase: &str) -> bool {
    !phrase_ends(haystack, phrase).is_empty()
}

/// Expand abbreviations and common misspellings, lowercasing the text
pub fn normalize_query(text: &str, vocabulary: &Vocabulary) -> String {
    text.replace('\u{2019}', "'")
        .split_whitespace()
        .map(|token| {
            let lower = token.to_lowercase();
            let core = lower.trim_matches(|c: char| !c.is_alphanumeric());
            match vocabulary.substitution(core) {
                Some(replacement) if !core.is_empty() => lower.replacen(core, replacement, 1),
                _ => lower,
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Protocol codes cited in `text`, uppercased, in first-seen order
///
/// Four-digit numbers that are really doses ("1000 mg"), dates or decimals
/// are skipped.
pub fn extract_protocol_codes(text: &str) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for m in PROTOCOL_CODE.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        if matches!(before, Some('.' | ',' | '-' | '/' | ':' | '$')) {
            continue;
        }

        let rest = &text[m.end()..];
        let mut after = rest.chars();
        if let (Some('-' | '/' | ':'), Some(next)) = (after.next(), after.next()) {
            if next.is_ascii_digit() {
                continue;
            }
        }
        let next_word: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphabetic())
            .collect();
        if DoseUnit::parse(&next_word).is_some() {
            continue;
        }

        let code = m.as_str().to_ascii_uppercase();
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Canonical names of known substances mentioned in `text`
pub fn extract_substances(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> Vec<String> {
    let normalized = words(&normalize_query(text, vocabulary));
    formulary
        .known_substances()
        .filter(|name| contains_phrase(&normalized, name))
        .map(str::to_string)
        .collect()
}

/// Substance whose mention ends last in `words`
fn last_substance(words: &[String], formulary: &Formulary) -> Option<String> {
    formulary
        .known_substances()
        .filter_map(|name| {
            phrase_ends(words, name)
                .into_iter()
                .max()
                .map(|end| (end, name))
        })
        .max_by_key(|(end, _)| *end)
        .map(|(_, name)| name.to_string())
}

/// Substance whose mention starts first in `words`
fn first_substance(words: &[String], formulary: &Formulary) -> Option<String> {
    formulary
        .known_substances()
        .filter_map(|name| {
            let len = self::words(name).len();
            phrase_ends(words, name)
                .into_iter()
                .min()
                .map(|end| (end - len, name))
        })
        .min_by_key(|(start, _)| *start)
        .map(|(_, name)| name.to_string())
}

/// Start of the sentence containing byte offset `at`
fn sentence_start(text: &str, at: usize) -> usize {
    SENTENCE_BREAK
        .find_iter(&text[..at])
        .last()
        .map(|m| m.end())
        .unwrap_or(0)
}

/// End of the sentence continuing from byte offset `at`
fn sentence_end(text: &str, at: usize) -> usize {
    SENTENCE_BREAK
        .find(&text[at..])
        .map(|m| at + m.start())
        .unwrap_or(text.len())
}

/// Unlisted word standing where a substance name would
///
/// The nearest word before the amount, or the first word after it when the
/// amount directly follows an administration verb ("give 4 mg ketorolac").
fn unlisted_substance(
    before: &[String],
    after: &[String],
    vocabulary: &Vocabulary,
) -> Option<String> {
    let plausible = |word: &&String| {
        vocabulary.could_name_substance(word)
            && DoseUnit::parse(word).is_none()
            && Route::parse(word).is_none()
    };
    let mut preceding = before.iter().rev().filter(|w| !vocabulary.is_stop_word(w));
    match preceding.next() {
        Some(word) if plausible(&word) => Some(word.clone()),
        Some(word) if !vocabulary.is_administration_verb(word) => None,
        _ => after
            .iter()
            .find(|w| !vocabulary.is_stop_word(w))
            .filter(plausible)
            .cloned(),
    }
}

/// Dose mentions and the substance each is attributed to
///
/// Known substances are matched first; failing that, a word in a substance's
/// position is taken as an unlisted substance so the formulary check can
/// reject it.
pub fn extract_doses(
    text: &str,
    vocabulary: &Vocabulary,
    formulary: &Formulary,
) -> Vec<DoseMention> {
    let mut doses = Vec::new();

    for caps in DOSE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(amount) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        let Some(unit) = caps.get(3).and_then(|m| DoseUnit::parse(m.as_str())) else {
            continue;
        };
        let upper = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
        let per_kg = caps.get(4).is_some();
        let route = caps
            .get(5)
            .or_else(|| caps.get(6))
            .and_then(|m| Route::parse(m.as_str()));

        let prefix = &text[sentence_start(text, whole.start())..whole.start()];
        let before = words(&normalize_query(prefix, vocabulary));
        let before = &before[before.len().saturating_sub(SUBSTANCE_WINDOW_BEFORE)..];

        let rest = &text[whole.end()..sentence_end(text, whole.end())];
        let after = words(&normalize_query(rest, vocabulary));
        let after = &after[..after.len().min(SUBSTANCE_WINDOW_AFTER)];

        let substance = last_substance(before, formulary)
            .or_else(|| first_substance(after, formulary))
            .or_else(|| unlisted_substance(before, after, vocabulary));

        if let Some(substance) = substance {
            doses.push(DoseMention {
                text: format!("{} {}", substance, whole.as_str().trim()),
                substance,
                amount,
                upper,
                unit,
                per_kg,
                route,
            });
        }
    }
    doses
}

/// Split text into sentences without breaking decimal numbers
pub fn split_sentences(text: &str) -> Vec<&str> {
    SENTENCE_BREAK
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_expands_abbreviations() {
        let vocabulary = Vocabulary::default();
        assert_eq!(
            normalize_query("Versed dose for pt, then Epi?", &vocabulary),
            "midazolam dose for patient, then epinephrine?"
        );
    }

    #[test]
    fn test_extract_codes() {
        let codes = extract_protocol_codes("See 1210 and 1210-p, also ref 1211.1 and 1210.");
        assert_eq!(codes, vec!["1210", "1210-P", "1211.1"]);
    }

    #[test]
    fn test_codes_skip_doses_dates_and_decimals() {
        assert!(extract_protocol_codes("give 1000 mg over 10 minutes").is_empty());
        assert!(extract_protocol_codes("updated 2024-01-15").is_empty());
        assert!(extract_protocol_codes("0.0125 mg").is_empty());
        assert!(extract_protocol_codes("12345").is_empty());
    }

    #[test]
    fn test_extract_substances_uses_substitutions() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let substances = extract_substances("narcan or bicarb?", &vocabulary, &formulary);
        assert_eq!(substances, vec!["naloxone", "sodium bicarbonate"]);
    }

    #[test]
    fn test_extract_dose_with_route() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let doses = extract_doses("Epinephrine 1 mg IV every 3-5 minutes", &vocabulary, &formulary);
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "epinephrine");
        assert_eq!(doses[0].amount, 1.0);
        assert_eq!(doses[0].unit, DoseUnit::Mg);
        assert_eq!(doses[0].route, Some(Route::Iv));
        assert!(!doses[0].per_kg);
    }

    #[test]
    fn test_extract_weight_based_range() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let doses = extract_doses("versed 0.1-0.2 mg/kg IN", &vocabulary, &formulary);
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "midazolam");
        assert_eq!(doses[0].upper, Some(0.2));
        assert!(doses[0].per_kg);
        assert_eq!(doses[0].route, Some(Route::In));
    }

    #[test]
    fn test_lowercase_in_is_not_a_route() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let doses = extract_doses("epinephrine 1 mg in 10 mL", &vocabulary, &formulary);
        assert_eq!(doses[0].route, None);
    }

    #[test]
    fn test_nearest_substance_wins() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let doses = extract_doses(
            "Epinephrine 1 mg IV, then amiodarone 300 mg IV",
            &vocabulary,
            &formulary,
        );
        let names: Vec<&str> = doses.iter().map(|d| d.substance.as_str()).collect();
        assert_eq!(names, vec!["epinephrine", "amiodarone"]);
    }

    #[test]
    fn test_substance_after_amount() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        let doses = extract_doses("Give 2 mg midazolam now.", &vocabulary, &formulary);
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "midazolam");
    }

    #[test]
    fn test_dose_without_substance_is_ignored() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        assert!(extract_doses("Bolus 500 mL normal saline", &vocabulary, &formulary).is_empty());
        assert!(extract_doses("Do not exceed 10 mg.", &vocabulary, &formulary).is_empty());
        assert!(extract_doses("May repeat 150 mg once.", &vocabulary, &formulary).is_empty());
    }

    #[test]
    fn test_unlisted_substance_is_attributed() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();

        let doses = extract_doses("Per 1231, administer morphine 4 mg IV.", &vocabulary, &formulary);
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "morphine");
        assert_eq!(doses[0].route, Some(Route::Iv));

        let doses = extract_doses("Give 15 mg of ketorolac IM.", &vocabulary, &formulary);
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "ketorolac");
    }

    #[test]
    fn test_substance_search_stays_in_sentence() {
        let vocabulary = Vocabulary::default();
        let formulary = Formulary::default();
        assert!(extract_doses("Give 2 mg. Midazolam is next.", &vocabulary, &formulary).is_empty());
    }

    #[test]
    fn test_sentences_keep_decimals() {
        let sentences = split_sentences("Give 0.5 mg. Do not repeat; reassess\nDone");
        assert_eq!(sentences, vec!["Give 0.5 mg", "Do not repeat", "reassess", "Done"]);
    }
}
