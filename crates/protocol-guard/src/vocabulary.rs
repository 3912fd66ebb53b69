//! Extraction vocabulary
//!
//! Tables driving query normalisation and phrase detection. They are plain
//! data so deployments can replace them from a TOML, YAML or JSON file
//! without touching the matching code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;

/// Lookup tables used by the extractors and stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Abbreviation or common misspelling -> canonical text
    pub substitutions: BTreeMap<String, String>,
    /// Terms that carry no clinical specificity
    pub vague_terms: Vec<String>,
    /// Words ignored when counting meaningful tokens
    pub stop_words: Vec<String>,
    /// Phrases that mean "contact the base hospital"
    pub escalation_phrases: Vec<String>,
    /// Markers that turn an instruction into a prohibition
    pub negation_markers: Vec<String>,
    /// Verbs of an administration instruction
    pub administration_verbs: Vec<String>,
    /// Words that make a prohibition conditional rather than absolute
    pub condition_markers: Vec<String>,
    /// Words that sit next to an amount without naming a substance
    pub dose_qualifiers: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        let substitutions = [
            ("epi", "epinephrine"),
            ("adrenaline", "epinephrine"),
            ("epinephrin", "epinephrine"),
            ("epinepherine", "epinephrine"),
            ("versed", "midazolam"),
            ("midazolom", "midazolam"),
            ("narcan", "naloxone"),
            ("naloxon", "naloxone"),
            ("ntg", "nitroglycerin"),
            ("nitro", "nitroglycerin"),
            ("zofran", "ondansetron"),
            ("ondansatron", "ondansetron"),
            ("benadryl", "diphenhydramine"),
            ("asa", "aspirin"),
            ("amio", "amiodarone"),
            ("albuteral", "albuterol"),
            ("bicarb", "sodium bicarbonate"),
            ("d10", "dextrose"),
            ("d50", "dextrose"),
            ("pt", "patient"),
            ("pts", "patients"),
            ("peds", "pediatric"),
            ("ped", "pediatric"),
            ("sob", "shortness of breath"),
            ("cp", "chest pain"),
            ("ams", "altered mental status"),
            ("loc", "loss of consciousness"),
            ("vfib", "ventricular fibrillation"),
            ("vtach", "ventricular tachycardia"),
            ("svt", "supraventricular tachycardia"),
            ("bhc", "base hospital contact"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            substitutions,
            vague_terms: owned(&[
                "help", "info", "information", "something", "stuff", "thing", "things",
                "anything", "general", "question", "protocol", "treatment", "guidance",
                "patient", "what",
            ]),
            stop_words: owned(&[
                "a", "an", "the", "for", "of", "to", "in", "on", "and", "or", "is", "are",
                "with", "how", "do", "does", "i", "my", "me", "we", "should", "can",
                "please", "about", "this", "that", "it", "be",
            ]),
            escalation_phrases: owned(&[
                "base hospital",
                "base contact",
                "contact base",
                "medical control",
                "online medical direction",
            ]),
            negation_markers: owned(&[
                "do not",
                "don't",
                "dont",
                "never",
                "avoid",
                "withhold",
                "contraindicated",
                "should not",
                "shouldn't",
                "must not",
                "no need to",
                "not required",
                "not necessary",
                "and not",
                "but not",
                "rather than",
                "instead of",
            ]),
            administration_verbs: owned(&[
                "administer",
                "administered",
                "give",
                "given",
                "push",
                "start",
                "repeat",
                "provide",
            ]),
            condition_markers: owned(&["if", "unless", "when", "in patients with"]),
            dose_qualifiers: owned(&[
                "dose", "doses", "dosing", "initial", "additional", "maximum", "max", "total",
                "then", "may", "every", "up", "bolus", "infusion", "drip", "another", "second",
                "first", "each", "over", "single", "once", "twice", "adult", "adults",
                "pediatric", "child", "children", "infant", "patient", "patients", "weight",
                "rate", "concentration", "titrate", "exceed", "reduce", "increase", "consider",
                "use", "dilute", "diluted", "normal", "saline", "fluid", "fluids", "water",
                "via", "by", "at", "per", "from", "than", "more", "less", "not", "no",
            ]),
        }
    }
}

impl Vocabulary {
    /// Load a vocabulary from a TOML, YAML or JSON file
    ///
    /// Missing sections keep their built-in defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let vocabulary: Vocabulary = protocol_guard_core::config::load_file(path)?;
        tracing::info!(
            substitutions = vocabulary.substitutions.len(),
            escalation_phrases = vocabulary.escalation_phrases.len(),
            "Loaded vocabulary"
        );
        Ok(vocabulary)
    }

    pub fn substitution(&self, token: &str) -> Option<&str> {
        self.substitutions.get(token).map(String::as_str)
    }

    pub fn is_vague(&self, token: &str) -> bool {
        self.vague_terms.iter().any(|t| t == token)
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.iter().any(|t| t == token)
    }

    pub fn is_administration_verb(&self, token: &str) -> bool {
        self.administration_verbs.iter().any(|t| t == token)
    }

    /// Whether `token` could name a substance the formulary does not list
    pub fn could_name_substance(&self, token: &str) -> bool {
        token.chars().count() >= 3
            && token.chars().all(char::is_alphabetic)
            && !self.is_stop_word(token)
            && !self.is_vague(token)
            && !self.is_administration_verb(token)
            && !self.dose_qualifiers.iter().any(|t| t == token)
            && !self
                .negation_markers
                .iter()
                .chain(&self.condition_markers)
                .any(|m| m.split_whitespace().any(|w| w == token))
    }
}
