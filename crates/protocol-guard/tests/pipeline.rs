//! Integration tests for the validation pipeline
//!
//! Covers:
//! - Dose checks on correct and overdosed epinephrine answers
//! - Contradiction detection in model answers
//! - Medications outside the formulary and refused base contact
//! - Citation checking (property based)
//! - Dose range boundaries (property based)
//! - Retrieval -> validation -> monitor flow with a failing primary store
//! - The bundled sample protocol file
//! - CLI dispatch and exit codes

use async_trait::async_trait;
use clap::Parser;
use proptest::prelude::*;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use protocol_guard::cli::commands;
use protocol_guard::protocol_guard_core::{
    FileProtocolIndex, ProtocolChunk, ProtocolRecord, ProtocolSource, RecoveryStrategy,
    RetrievalCoordinator, SearchOptions, SourceError, SourceResult,
};
use protocol_guard::{
    ExitCode, GuardCli, GuardMetrics, Severity, ValidationMonitor, ValidationPipeline,
    ValidationStage,
};

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data/protocols.json")
}

fn sample_records() -> Vec<ProtocolRecord> {
    FileProtocolIndex::from_file(sample_path())
        .unwrap()
        .records()
        .to_vec()
}

fn cardiac_arrest() -> ProtocolRecord {
    ProtocolRecord::new(
        "1210",
        "Cardiac Arrest",
        "Begin CPR. Epinephrine 1 mg IV/IO every 3-5 minutes. Amiodarone 300 mg IV/IO.",
    )
}

fn pipeline_over(records: Vec<ProtocolRecord>) -> ValidationPipeline {
    ValidationPipeline::new(Arc::new(FileProtocolIndex::from_records(records)))
}

#[test]
fn test_correct_epinephrine_dose_passes() {
    let records = vec![cardiac_arrest()];
    let result = pipeline_over(records.clone())
        .validate_output("Per 1210, give epinephrine 1 mg IV every 3-5 minutes.", &records);

    assert!(result.valid, "{:?}", result.findings);
    assert!(!result.has_code("DOSE_OUT_OF_RANGE"));
    assert!(result.findings.is_empty());
}

#[test]
fn test_overdose_is_critical_with_range() {
    let records = vec![cardiac_arrest()];
    let result = pipeline_over(records.clone()).validate_output("Give epinephrine 5 mg IV.", &records);

    assert!(result.must_suppress());
    let finding = result
        .findings
        .iter()
        .find(|f| f.code == "DOSE_OUT_OF_RANGE")
        .expect("dose finding");
    assert_eq!(finding.severity, Severity::Critical);
    let context = finding.context.as_ref().unwrap();
    assert_eq!(context["range"], "0.01-1 mg");
    assert_eq!(context["substance"], "epinephrine");
}

#[test]
fn test_contradiction_reported_once_per_substance() {
    let answer = "Administer midazolam 2 mg IV for active seizure. \
                  Do not administer midazolam to this patient. Never give midazolam twice.";
    let result = pipeline_over(Vec::new()).validate_output(answer, &[]);

    let contradictions: Vec<_> = result
        .findings
        .iter()
        .filter(|f| f.code == "RESPONSE_CONTRADICTIONS")
        .collect();
    assert_eq!(contradictions.len(), 1);
    assert_eq!(contradictions[0].severity, Severity::Error);
    assert_eq!(contradictions[0].context.as_ref().unwrap()["substance"], "midazolam");
    assert!(!result.valid);
    assert!(!result.must_suppress());
}

#[test]
fn test_abbreviations_are_checked_like_full_names() {
    let records = vec![cardiac_arrest()];
    let result = pipeline_over(records.clone()).validate_output("Push epi 3 mg IV now.", &records);
    assert!(result.has_code("DOSE_OUT_OF_RANGE"));
}

#[test]
fn test_medication_outside_formulary_is_suppressed() {
    let records = sample_records();
    let answer = "Per 1231, administer morphine 4 mg IV. Contact base hospital for repeat doses.";
    let result = pipeline_over(records.clone()).validate_output(answer, &records);

    assert!(!result.valid);
    assert!(result.must_suppress());
    assert!(result.has_code("UNAUTHORIZED_MEDICATION"));
    assert!(!result.has_code("MISSING_BASE_CONTACT"));
}

#[test]
fn test_refusing_base_contact_fails_requirement() {
    let records = sample_records();
    let result = pipeline_over(records.clone())
        .validate_output("Per 1231, base hospital contact is not required.", &records);

    assert!(!result.valid);
    assert!(result.has_code("MISSING_BASE_CONTACT"));
}

proptest! {
    #[test]
    fn prop_foreign_citation_is_hallucinated(
        number in 1000u32..10000,
        suffix in prop_oneof![Just(""), Just("-P"), Just(".1")],
    ) {
        let code = format!("{}{}", number, suffix);
        prop_assume!(code != "1210");

        let records = vec![cardiac_arrest()];
        let answer = format!("According to protocol {}, begin CPR immediately.", code);
        let result = pipeline_over(records.clone()).validate_output(&answer, &records);

        let finding = result.findings.iter().find(|f| f.code == "HALLUCINATED_CITATION");
        prop_assert!(finding.is_some(), "no citation finding for {}", code);
        prop_assert_eq!(finding.unwrap().severity, Severity::Critical);
        prop_assert!(result.must_suppress());
    }

    #[test]
    fn prop_in_range_dose_is_accepted(amount in 0.01f64..=1.0) {
        let records = vec![cardiac_arrest()];
        let answer = format!("Give epinephrine {} mg IV.", amount);
        let result = pipeline_over(records.clone()).validate_output(&answer, &records);
        prop_assert!(!result.has_code("DOSE_OUT_OF_RANGE"), "{} flagged", answer);
    }

    #[test]
    fn prop_out_of_range_dose_is_flagged(
        amount in prop_oneof![0.0001f64..0.0099, 1.0001f64..999.0],
    ) {
        let records = vec![cardiac_arrest()];
        let answer = format!("Give epinephrine {} mg IV.", amount);
        let result = pipeline_over(records.clone()).validate_output(&answer, &records);
        prop_assert!(result.has_code("DOSE_OUT_OF_RANGE"), "{} not flagged", answer);
    }
}

/// Primary store that is always down
#[derive(Debug)]
struct DownStore;

#[async_trait]
impl ProtocolSource for DownStore {
    fn name(&self) -> &str {
        "down"
    }

    async fn get_record_by_code(&self, _code: &str) -> SourceResult<Option<ProtocolRecord>> {
        Err(SourceError::Unavailable("maintenance".to_string()))
    }

    async fn search_records(
        &self,
        _query: &str,
        _options: &SearchOptions,
    ) -> SourceResult<Vec<ProtocolChunk>> {
        Err(SourceError::Unavailable("maintenance".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_degraded_retrieval_flows_through_validation() {
    let local: Arc<dyn ProtocolSource> = Arc::new(FileProtocolIndex::from_records(sample_records()));
    let coordinator = RetrievalCoordinator::builder(Arc::new(DownStore))
        .local_source(Arc::clone(&local))
        .build();

    let retrieved = coordinator.retrieve_with_fallback("1231").await;
    assert!(retrieved.success);
    assert_eq!(retrieved.strategy_used, RecoveryStrategy::FileFallback);
    let record = retrieved.data.clone().unwrap();
    let records = vec![record.clone()];

    let monitor = Arc::new(ValidationMonitor::default());
    let metrics = Arc::new(GuardMetrics::new().unwrap());
    metrics.observe_recovery(&retrieved, &coordinator);
    let pipeline = ValidationPipeline::new(local)
        .with_monitor(Arc::clone(&monitor))
        .with_metrics(Arc::clone(&metrics));

    let query = pipeline.validate_query("versed dose for active seizure per 1231").await;
    assert!(query.valid, "{:?}", query.findings);

    let stage2 = pipeline.validate_retrieved_records(&records);
    assert!(stage2.valid, "{:?}", stage2.findings);

    let stage3 = pipeline.validate_assembled_context(&record.content, &records);
    assert!(stage3.valid, "{:?}", stage3.findings);

    let unsafe_answer = "Per 1231 and 1244, give midazolam 20 mg IV.";
    let stage4 = pipeline.validate_output(unsafe_answer, &records);
    assert!(stage4.must_suppress());
    for code in [
        "HALLUCINATED_CITATION",
        "DOSE_OUT_OF_RANGE",
        "MISSING_BASE_CONTACT",
        "MISSING_CONTRAINDICATIONS",
    ] {
        assert!(stage4.has_code(code), "missing {}", code);
    }

    let summary = monitor.metrics(None);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.success_rate, 75.0);
    assert!(!monitor.meets_success_target(99.0, None));
    assert_eq!(metrics.validations(ValidationStage::Output, false), 1.0);

    let report = monitor.generate_report(None);
    assert_eq!(report.recent_failures.len(), 1);
    assert_eq!(report.recent_failures[0].stage, ValidationStage::Output);

    let text = metrics.encode_text().unwrap();
    assert!(text.contains("strategy=\"file-fallback\""));
}

#[test]
fn test_sample_protocols_validate_cleanly() {
    let records = sample_records();
    assert_eq!(records.len(), 4);
    let pipeline = pipeline_over(records.clone());

    let stage2 = pipeline.validate_retrieved_records(&records);
    assert!(stage2.valid, "{:?}", stage2.findings);
    assert!(stage2.has_code("PROTOCOL_CONFLICTS"));
    assert!(stage2.has_code("CRITICAL_WARNINGS_PRESENT"));

    for record in &records {
        let stage3 = pipeline.validate_assembled_context(&record.content, std::slice::from_ref(record));
        assert!(stage3.valid, "{}: {:?}", record.code, stage3.findings);
        assert!(!stage3.has_code("DOSE_RANGE_UNKNOWN"), "{}: {:?}", record.code, stage3.findings);
    }
}

fn temp_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

#[tokio::test]
async fn test_cli_records_command_warns() {
    let path = sample_path();
    let cli = GuardCli::parse_from([
        "protocol-guard",
        "--quiet",
        "records",
        "--records",
        path.to_str().unwrap(),
    ]);
    let exit = commands::execute(cli).await.unwrap();
    assert_eq!(exit, ExitCode::ValidationWarning);
}

#[tokio::test]
async fn test_cli_output_command_fails_on_hallucination() {
    let answer = temp_file(".txt", "Follow protocol 9999 and give epinephrine 1 mg IV.");
    let path = sample_path();
    let cli = GuardCli::parse_from([
        "protocol-guard",
        "--quiet",
        "output",
        "--file",
        answer.path().to_str().unwrap(),
        "--records",
        path.to_str().unwrap(),
    ]);
    let exit = commands::execute(cli).await.unwrap();
    assert_eq!(exit, ExitCode::ValidationError);
}

#[tokio::test]
async fn test_cli_missing_records_file() {
    let cli = GuardCli::parse_from([
        "protocol-guard",
        "--quiet",
        "records",
        "--records",
        "/nonexistent/records.json",
    ]);
    let err = commands::execute(cli).await.unwrap_err();
    assert_eq!(ExitCode::from_error(&err), ExitCode::FileError);
}

#[tokio::test]
async fn test_cli_retrieve_from_store() {
    let path = sample_path();
    let cli = GuardCli::parse_from([
        "protocol-guard",
        "--quiet",
        "retrieve",
        "1241",
        "--store",
        path.to_str().unwrap(),
    ]);
    let exit = commands::execute(cli).await.unwrap();
    assert_eq!(exit, ExitCode::Success);
}
