//! Protocol data model
//!
//! Records are created by an external ingestion process and are read-only
//! here. Only one record per `code` may be current at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A treatment protocol as stored in the primary store or the local index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    /// Stable identifier, e.g. "1210" or "1210-P"
    pub code: String,
    /// Human-readable protocol name
    pub name: String,
    /// Free-text protocol body
    #[serde(default)]
    pub content: String,
    /// Warning statements attached to the protocol
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Contraindication statements attached to the protocol
    #[serde(default)]
    pub contraindications: Vec<String>,
    /// Whether a base hospital must be contacted before proceeding
    #[serde(default)]
    pub base_contact_required: bool,
    /// Whether this is the current version of the protocol
    #[serde(default = "default_true")]
    pub is_current: bool,
    /// When the protocol takes effect
    pub effective_date: DateTime<Utc>,
    /// When the protocol stops being valid
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ProtocolRecord {
    /// Create a current record effective from now
    pub fn new(code: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            content: content.into(),
            warnings: Vec::new(),
            contraindications: Vec::new(),
            base_contact_required: false,
            is_current: true,
            effective_date: Utc::now(),
            expiration_date: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_contraindication(mut self, contraindication: impl Into<String>) -> Self {
        self.contraindications.push(contraindication.into());
        self
    }

    pub fn with_base_contact(mut self, required: bool) -> Self {
        self.base_contact_required = required;
        self
    }

    pub fn with_current(mut self, current: bool) -> Self {
        self.is_current = current;
        self
    }

    pub fn with_effective_date(mut self, date: DateTime<Utc>) -> Self {
        self.effective_date = date;
        self
    }

    pub fn with_expiration_date(mut self, date: DateTime<Utc>) -> Self {
        self.expiration_date = Some(date);
        self
    }

    /// Whether the record is in force at `now`
    pub fn is_in_force_at(&self, now: DateTime<Utc>) -> bool {
        self.is_current
            && self.effective_date <= now
            && self.expiration_date.map_or(true, |exp| exp > now)
    }
}

/// A search hit returned by `search_records`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolChunk {
    /// Code of the protocol the chunk belongs to
    pub code: String,
    /// Title of the protocol or section
    pub title: String,
    /// Chunk text
    pub content: String,
    /// Relevance score as reported by the source (higher is better)
    pub score: f64,
}

impl ProtocolChunk {
    /// Build a whole-record chunk
    pub fn from_record(record: &ProtocolRecord, score: f64) -> Self {
        Self {
            code: record.code.clone(),
            title: record.name.clone(),
            content: record.content.clone(),
            score,
        }
    }
}

/// Options passed through to `search_records`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum number of hits
    pub limit: usize,
    /// Minimum score a hit must have
    pub min_score: f64,
    /// Only return current protocols
    pub current_only: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            current_only: true,
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }
}
