//! File-backed protocol index
//!
//! A lower-fidelity copy of the protocol set loaded from a JSON or YAML file.
//! Matching is plain token overlap; it exists to keep answering when the
//! primary store is down, not to rank well.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::traits::{LocalIndexLoader, ProtocolSource};
use crate::error::{SourceError, SourceResult};
use crate::model::{ProtocolChunk, ProtocolRecord, SearchOptions};

/// In-memory protocol index built from a file
#[derive(Debug, Clone)]
pub struct FileProtocolIndex {
    name: String,
    records: Vec<ProtocolRecord>,
}

impl FileProtocolIndex {
    /// Build an index from records already in memory
    pub fn from_records(records: Vec<ProtocolRecord>) -> Self {
        Self {
            name: "file-index".to_string(),
            records,
        }
    }

    /// Parse records from a string; `format` is "json", "yaml" or "yml"
    pub fn from_str_with_format(content: &str, format: &str) -> SourceResult<Self> {
        let records: Vec<ProtocolRecord> = match format {
            "json" => serde_json::from_str(content)?,
            "yaml" | "yml" => serde_yaml::from_str(content)?,
            other => {
                return Err(SourceError::DataError(format!(
                    "Unsupported index format: {}",
                    other
                )))
            }
        };
        Ok(Self::from_records(records))
    }

    /// Load records from a file, choosing the parser by extension
    pub fn from_file(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_str_with_format(&content, extension_of(path))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProtocolRecord] {
        &self.records
    }

    fn find_current(&self, code: &str) -> Option<&ProtocolRecord> {
        self.records
            .iter()
            .find(|r| r.is_current && r.code.eq_ignore_ascii_case(code))
    }

    fn score(record: &ProtocolRecord, query: &str, terms: &HashSet<String>) -> f64 {
        if record.code.eq_ignore_ascii_case(query.trim()) {
            return 1.0;
        }
        if terms.is_empty() {
            return 0.0;
        }
        let haystack = format!("{} {} {}", record.code, record.name, record.content).to_lowercase();
        let words: HashSet<&str> = haystack
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let hits = terms.iter().filter(|t| words.contains(t.as_str())).count();
        hits as f64 / terms.len() as f64
    }
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("json")
}

fn query_terms(query: &str) -> HashSet<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 || w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ProtocolSource for FileProtocolIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_record_by_code(&self, code: &str) -> SourceResult<Option<ProtocolRecord>> {
        Ok(self.find_current(code).cloned())
    }

    async fn search_records(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> SourceResult<Vec<ProtocolChunk>> {
        let terms = query_terms(query);
        let mut hits: Vec<ProtocolChunk> = self
            .records
            .iter()
            .filter(|r| !options.current_only || r.is_current)
            .map(|r| (r, Self::score(r, query, &terms)))
            .filter(|(_, score)| *score > 0.0 && *score >= options.min_score)
            .map(|(r, score)| ProtocolChunk::from_record(r, score))
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(options.limit);
        Ok(hits)
    }
}

/// Loads a `FileProtocolIndex` from disk on first use
#[derive(Debug, Clone)]
pub struct FileIndexLoader {
    path: PathBuf,
}

impl FileIndexLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalIndexLoader for FileIndexLoader {
    fn name(&self) -> &str {
        "file-index"
    }

    async fn load(&self) -> SourceResult<Arc<dyn ProtocolSource>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let index = FileProtocolIndex::from_str_with_format(&content, extension_of(&self.path))?;
        tracing::info!(
            path = %self.path.display(),
            records = index.len(),
            "Loaded local protocol index"
        );
        Ok(Arc::new(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_index() -> FileProtocolIndex {
        FileProtocolIndex::from_records(vec![
            ProtocolRecord::new("1210", "Cardiac Arrest", "Begin CPR and give epinephrine"),
            ProtocolRecord::new("1211", "Cardiac Chest Pain", "Aspirin and nitroglycerin"),
            ProtocolRecord::new("1233", "Respiratory Distress", "Albuterol nebulized")
                .with_current(false),
        ])
    }

    #[tokio::test]
    async fn test_get_by_code() {
        let index = sample_index();
        let record = index.get_record_by_code("1210").await.unwrap().unwrap();
        assert_eq!(record.name, "Cardiac Arrest");
        assert!(index.get_record_by_code("9999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_superseded_records_are_not_returned() {
        let index = sample_index();
        assert!(index.get_record_by_code("1233").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let index = sample_index();
        let hits = index
            .search_records("cardiac arrest epinephrine", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits[0].code, "1210");
        assert!(hits.iter().all(|h| h.code != "1233"));
    }

    #[tokio::test]
    async fn test_search_exact_code() {
        let index = sample_index();
        let hits = index
            .search_records("1211", &SearchOptions::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_loader_reads_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "- code: \"1242\"\n  name: Crush Injury\n  content: Consider calcium chloride\n  effective_date: 2024-01-01T00:00:00Z\n  base_contact_required: true"
        )
        .unwrap();

        let loader = FileIndexLoader::new(file.path());
        let index = loader.load().await.unwrap();
        let record = index.get_record_by_code("1242").await.unwrap().unwrap();
        assert!(record.base_contact_required);
    }

    #[test]
    fn test_unsupported_format() {
        let err = FileProtocolIndex::from_str_with_format("", "csv").unwrap_err();
        assert!(matches!(err, SourceError::DataError(_)));
    }
}
