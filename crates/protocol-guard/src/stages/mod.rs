//! The four validation stages
//!
//! Each stage is independently callable and returns a [`ValidationResult`];
//! none of them aborts on a finding. The pipeline records every result with
//! the attached [`ValidationMonitor`] and [`GuardMetrics`], if any, and queues
//! an audit record carrying a hash of the validated text on the attached
//! [`AuditEmitter`].
//!
//! | Stage | Input | Blocking codes |
//! |-------|-------|----------------|
//! | query | user text | `INVALID_PROTOCOL_CODE` |
//! | retrieval | fetched records | `DEPRECATED_PROTOCOL`, `PROTOCOL_EXPIRED`, `INCOMPLETE_PROTOCOL`, `PROTOCOL_NOT_EFFECTIVE`, `MISSING_PROTOCOL_NAME` |
//! | context | assembled context | `UNRETRIEVED_CITATION`, `DOSE_OUT_OF_RANGE`, `UNAUTHORIZED_MEDICATION`, `MISSING_BASE_CONTACT` |
//! | output | model answer | `HALLUCINATED_CITATION`, `DOSE_OUT_OF_RANGE`, `UNAUTHORIZED_MEDICATION`, `RESPONSE_CONTRADICTIONS`, `MISSING_BASE_CONTACT` |

mod common;
mod context;
mod output;
mod query;
mod retrieval;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use protocol_guard_core::{AuditEmitter, AuditRecord, ProtocolRecord, ProtocolSource};

use crate::finding::{Severity, ValidationResult, ValidationStage};
use crate::formulary::Formulary;
use crate::metrics::GuardMetrics;
use crate::monitor::ValidationMonitor;
use crate::vocabulary::Vocabulary;

/// Runs the validation stages against shared tables
#[derive(Clone)]
pub struct ValidationPipeline {
    vocabulary: Arc<Vocabulary>,
    formulary: Arc<Formulary>,
    /// Answers "does this protocol code exist" for the query stage
    lookup: Arc<dyn ProtocolSource>,
    monitor: Option<Arc<ValidationMonitor>>,
    metrics: Option<Arc<GuardMetrics>>,
    audit: Option<AuditEmitter>,
}

impl fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("lookup", &self.lookup.name())
            .field("substances", &self.formulary.substances.len())
            .field("monitor", &self.monitor.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl ValidationPipeline {
    /// Pipeline with the built-in vocabulary and formulary
    pub fn new(lookup: Arc<dyn ProtocolSource>) -> Self {
        Self {
            vocabulary: Arc::new(Vocabulary::default()),
            formulary: Arc::new(Formulary::default()),
            lookup,
            monitor: None,
            metrics: None,
            audit: None,
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: Arc<Vocabulary>) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_formulary(mut self, formulary: Arc<Formulary>) -> Self {
        self.formulary = formulary;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<ValidationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GuardMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn formulary(&self) -> &Formulary {
        &self.formulary
    }

    pub fn monitor(&self) -> Option<&Arc<ValidationMonitor>> {
        self.monitor.as_ref()
    }

    /// Stage 1: validate the user's query before dispatch
    pub async fn validate_query(&self, text: &str) -> ValidationResult {
        let started = Instant::now();
        let result =
            query::check(text, &self.vocabulary, &self.formulary, self.lookup.as_ref()).await;
        self.finish(ValidationStage::Query, result, started, Some(text), &[text])
    }

    /// Stage 2: validate the records retrieval produced
    pub fn validate_retrieved_records(&self, records: &[ProtocolRecord]) -> ValidationResult {
        self.validate_retrieved_records_at(records, Utc::now())
    }

    /// Stage 2 against an explicit clock
    pub fn validate_retrieved_records_at(
        &self,
        records: &[ProtocolRecord],
        now: DateTime<Utc>,
    ) -> ValidationResult {
        let started = Instant::now();
        let result = retrieval::check(records, now);
        let codes: Vec<&str> = records.iter().map(|r| r.code.as_str()).collect();
        self.finish(ValidationStage::Retrieval, result, started, None, &codes)
    }

    /// Stage 3: validate the context assembled for the model
    pub fn validate_assembled_context(
        &self,
        text: &str,
        records: &[ProtocolRecord],
    ) -> ValidationResult {
        let started = Instant::now();
        let result = context::check(text, records, &self.vocabulary, &self.formulary);
        self.finish(ValidationStage::Context, result, started, None, &audit_inputs(text, records))
    }

    /// Stage 4: validate the model's answer against its sources
    ///
    /// A critical finding means the answer must not be delivered.
    pub fn validate_output(&self, text: &str, records: &[ProtocolRecord]) -> ValidationResult {
        let started = Instant::now();
        let result = output::check(text, records, &self.vocabulary, &self.formulary);
        self.finish(ValidationStage::Output, result, started, None, &audit_inputs(text, records))
    }

    fn finish(
        &self,
        stage: ValidationStage,
        result: ValidationResult,
        started: Instant,
        query: Option<&str>,
        inputs: &[&str],
    ) -> ValidationResult {
        let elapsed = started.elapsed();

        if result.valid {
            tracing::debug!(
                stage = %stage,
                findings = result.findings.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Validation passed"
            );
        } else {
            tracing::info!(
                stage = %stage,
                codes = ?result.errors().map(|f| f.code.as_str()).collect::<Vec<_>>(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Validation failed"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_validation(stage, &result, elapsed);
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_validation(stage, &result, elapsed, query.map(str::to_string));
        }
        if let Some(audit) = &self.audit {
            let record = AuditRecord::new(
                format!("validate_{}", stage),
                json!({
                    "stage": stage,
                    "valid": result.valid,
                    "suppress": result.must_suppress(),
                    "codes": result.codes(),
                    "critical": result.count(Severity::Critical),
                    "errors": result.count(Severity::Error),
                    "warnings": result.count(Severity::Warning),
                    "duration_ms": elapsed.as_secs_f64() * 1_000.0,
                }),
            )
            .with_hashed_inputs(inputs);
            audit.emit(record);
        }

        result
    }
}

/// Validated text followed by the codes of the records it was checked against
fn audit_inputs<'a>(text: &'a str, records: &'a [ProtocolRecord]) -> Vec<&'a str> {
    std::iter::once(text)
        .chain(records.iter().map(|r| r.code.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use protocol_guard_core::audit::hash_inputs;
    use protocol_guard_core::{AuditError, AuditSink, FileProtocolIndex};

    const CARDIAC_ARREST: &str = "Adult cardiac arrest. Begin CPR, attach monitor. \
        Epinephrine 1 mg IV/IO every 3-5 minutes. Amiodarone 300 mg IV/IO for refractory VF.";

    fn records() -> Vec<ProtocolRecord> {
        vec![
            ProtocolRecord::new("1210", "Cardiac Arrest", CARDIAC_ARREST),
            ProtocolRecord::new(
                "1231",
                "Seizure",
                "Midazolam 5 mg IM or 2-5 mg IV for active seizure. Contact base hospital for repeat doses.",
            )
            .with_base_contact(true)
            .with_contraindication("hypotension"),
        ]
    }

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new(Arc::new(FileProtocolIndex::from_records(records())))
    }

    #[tokio::test]
    async fn test_query_normalization_metadata() {
        let result = pipeline()
            .validate_query("versed dose for seizing pt per 1231")
            .await;
        assert!(result.valid);
        assert_eq!(result.metadata["protocol_codes"], serde_json::json!(["1231"]));
        assert_eq!(result.metadata["medications"], serde_json::json!(["midazolam"]));
        assert!(!result.has_code("MEDICATION_WITHOUT_PROTOCOL"));
    }

    #[tokio::test]
    async fn test_query_unknown_code() {
        let result = pipeline()
            .validate_query("What does protocol 9999 say about chest pain management?")
            .await;
        assert!(!result.valid);
        assert!(result.has_code("INVALID_PROTOCOL_CODE"));
    }

    #[tokio::test]
    async fn test_query_vague_and_unauthorized() {
        let pipeline = pipeline();

        let result = pipeline.validate_query("help with stuff").await;
        assert!(result.valid);
        assert!(result.has_code("VAGUE_QUERY"));

        let result = pipeline
            .validate_query("can I give ketamine for agitated combative patients")
            .await;
        assert!(result.has_code("UNAUTHORIZED_MEDICATION_QUERY"));
        assert!(result.has_code("MEDICATION_WITHOUT_PROTOCOL"));
    }

    #[test]
    fn test_retrieved_record_checks() {
        let now = Utc::now();
        let stale = ProtocolRecord::new("1210", "Cardiac Arrest", CARDIAC_ARREST)
            .with_current(false)
            .with_expiration_date(now - Duration::days(1));
        let future = ProtocolRecord::new("1211", "", "too short")
            .with_effective_date(now + Duration::days(7))
            .with_warning("Verify placement");

        let result = pipeline().validate_retrieved_records_at(&[stale, future], now);
        assert!(result.must_suppress());
        for code in [
            "DEPRECATED_PROTOCOL",
            "PROTOCOL_EXPIRED",
            "PROTOCOL_NOT_EFFECTIVE",
            "INCOMPLETE_PROTOCOL",
            "MISSING_PROTOCOL_NAME",
            "CRITICAL_WARNINGS_PRESENT",
        ] {
            assert!(result.has_code(code), "missing {}", code);
        }
    }

    #[test]
    fn test_retrieved_conflicts() {
        let result = pipeline().validate_retrieved_records(&records());
        assert!(result.valid);
        assert_eq!(result.codes(), vec!["PROTOCOL_CONFLICTS"]);

        let duplicate = vec![records()[0].clone(), records()[0].clone()];
        let result = pipeline().validate_retrieved_records(&duplicate);
        assert!(result.has_code("PROTOCOL_CONFLICTS"));

        let result = pipeline().validate_retrieved_records(&[]);
        assert_eq!(result.codes(), vec!["NO_PROTOCOLS_RETRIEVED"]);
    }

    #[test]
    fn test_context_checks() {
        let records = records();
        let context = "Protocol 1210 and 1231. Epinephrine 1 mg IV. See also 1244.";
        let result = pipeline().validate_assembled_context(context, &records);
        assert!(!result.valid);
        assert_eq!(
            result.codes(),
            vec!["UNRETRIEVED_CITATION", "MISSING_BASE_CONTACT"]
        );
        assert_eq!(result.count(crate::finding::Severity::Error), 2);
    }

    #[test]
    fn test_output_missing_contraindications_and_base_contact() {
        let records = records();
        let answer = "Per 1231, give midazolam 5 mg IM for active seizure.";
        let result = pipeline().validate_output(answer, &records);
        assert!(!result.must_suppress());
        assert!(result.has_code("MISSING_BASE_CONTACT"));
        assert!(result.has_code("MISSING_CONTRAINDICATIONS"));

        let answer = "Per 1231, give midazolam 5 mg IM. Avoid in hypotension. Contact base hospital for repeat doses.";
        let result = pipeline().validate_output(answer, &records);
        assert!(result.valid, "{:?}", result.findings);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_output_unauthorized_dose() {
        let answer = "Give ketamine 50 mg IV for sedation.";
        let result = pipeline().validate_output(answer, &records());
        assert!(result.must_suppress());
        assert!(result.has_code("UNAUTHORIZED_MEDICATION"));
    }

    #[test]
    fn test_unlisted_medication_in_context_and_output() {
        let records = records();
        let text = "Per 1231, administer morphine 4 mg IV. Contact base hospital for repeat doses.";

        let context = pipeline().validate_assembled_context(text, &records);
        assert!(context.must_suppress());
        assert_eq!(context.codes(), vec!["UNAUTHORIZED_MEDICATION"]);

        let output = pipeline().validate_output(text, &records);
        assert!(output.must_suppress());
        let finding = output
            .findings
            .iter()
            .find(|f| f.code == "UNAUTHORIZED_MEDICATION")
            .unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.context.as_ref().unwrap()["substance"], "morphine");
    }

    #[test]
    fn test_ruled_out_base_contact_is_missing() {
        let records = records();
        for answer in [
            "Per 1231, give midazolam 5 mg IM. Avoid in hypotension. Base hospital contact is not required.",
            "Per 1231, give midazolam 5 mg IM. Avoid in hypotension. Do not contact base hospital.",
        ] {
            let result = pipeline().validate_output(answer, &records);
            assert!(!result.valid, "{}", answer);
            assert_eq!(result.codes(), vec!["MISSING_BASE_CONTACT"], "{}", answer);
            assert_eq!(
                result.findings[0].context.as_ref().unwrap()["gap"],
                "ruled_out"
            );

            let result = pipeline().validate_assembled_context(answer, &records);
            assert_eq!(result.codes(), vec!["MISSING_BASE_CONTACT"], "{}", answer);
        }
    }

    #[derive(Clone, Default)]
    struct CapturingSink(Arc<std::sync::Mutex<Vec<AuditRecord>>>);

    #[async_trait::async_trait]
    impl AuditSink for CapturingSink {
        async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_results_reach_audit_sink() {
        let sink = CapturingSink::default();
        let (emitter, worker) = AuditEmitter::spawn(sink.clone(), 16);
        let pipeline = pipeline().with_audit(emitter);
        let records = records();
        let answer = "Per 9999 give epinephrine 1 mg IV";

        pipeline.validate_query("epinephrine dose in protocol 1210").await;
        pipeline.validate_output(answer, &records);
        drop(pipeline);
        worker.join().await;

        let captured = sink.0.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].operation, "validate_query");
        assert_eq!(captured[0].inputs_hash, hash_inputs(&["epinephrine dose in protocol 1210"]));

        let output = &captured[1];
        assert_eq!(output.operation, "validate_output");
        assert!(output.subject.is_none());
        assert_eq!(output.inputs_hash, hash_inputs(&[answer, "1210", "1231"]));
        assert_eq!(output.outcome["valid"], false);
        assert_eq!(output.outcome["suppress"], true);
        assert_eq!(output.outcome["codes"][0], "HALLUCINATED_CITATION");
    }

    #[tokio::test]
    async fn test_results_reach_monitor() {
        let monitor = Arc::new(ValidationMonitor::default());
        let pipeline = pipeline().with_monitor(monitor.clone());

        pipeline.validate_query("epinephrine dose in protocol 1210 cardiac arrest").await;
        pipeline.validate_output("Per 9999 give epinephrine 1 mg IV", &records());

        let metrics = monitor.metrics(None);
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(monitor.patterns(1)[0].code, "HALLUCINATED_CITATION");
    }
}
