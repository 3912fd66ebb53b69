//! CLI command definitions and handlers

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol_guard_core::{
    AuditEmitter, AuditWorker, FileIndexLoader, FileProtocolIndex, HealthStatus, JsonlAuditSink,
    ProtocolRecord, ProtocolSource, RetrievalCoordinator, SearchOptions, TracingAuditSink,
};

use super::output::{self, OutputFormat};
use super::ExitCode;
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::finding::ValidationResult;
use crate::metrics::GuardMetrics;
use crate::monitor::ValidationMonitor;
use crate::stages::ValidationPipeline;

const AUDIT_QUEUE_SIZE: usize = 256;

/// Protocol Guard CLI
///
/// Validate queries, retrieved protocols, assembled context and model answers,
/// and exercise the tiered retrieval path.
#[derive(Parser, Debug)]
#[command(name = "protocol-guard")]
#[command(about = "Protocol Guard - resilient retrieval and answer validation", long_about = None)]
#[command(version)]
pub struct GuardCli {
    /// Output verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "PROTOCOL_GUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    pub format: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: GuardCommands,
}

/// Text given inline or read from a file
#[derive(Args, Debug, Clone)]
pub struct TextInput {
    /// Text to validate
    #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
    pub text: Option<String>,

    /// File holding the text to validate
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

impl TextInput {
    pub fn read(&self) -> Result<String> {
        match (&self.text, &self.file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                GuardError::file_error(format!("Failed to read '{}': {}", path.display(), e))
            }),
            (None, None) => Err(GuardError::invalid_input("either --text or --file is required")),
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum GuardCommands {
    /// Validate a user query (stage 1)
    Query {
        /// The query text
        text: String,

        /// Protocol index used to check cited codes
        #[arg(long)]
        index: Option<PathBuf>,
    },

    /// Validate retrieved protocol records (stage 2)
    Records {
        /// JSON or YAML file with the retrieved records
        #[arg(short, long)]
        records: PathBuf,
    },

    /// Validate an assembled model context (stage 3)
    Context {
        #[command(flatten)]
        input: TextInput,

        /// JSON or YAML file with the retrieved records
        #[arg(short, long)]
        records: PathBuf,
    },

    /// Validate a model answer against its sources (stage 4)
    Output {
        #[command(flatten)]
        input: TextInput,

        /// JSON or YAML file with the source records
        #[arg(short, long)]
        records: PathBuf,
    },

    /// Fetch a protocol through the retrieval cascade
    Retrieve {
        /// Protocol code to fetch
        #[arg(required_unless_present = "search")]
        code: Option<String>,

        /// Search text instead of a code
        #[arg(long, conflicts_with = "code")]
        search: Option<String>,

        /// Records acting as the primary store
        #[arg(long)]
        store: PathBuf,

        /// Local index fallback (defaults to paths.local_index)
        #[arg(long)]
        index: Option<PathBuf>,

        /// Maximum search hits
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Report retrieval health
    Health {
        /// Records acting as the primary store
        #[arg(long)]
        store: PathBuf,

        /// Local index fallback (defaults to paths.local_index)
        #[arg(long)]
        index: Option<PathBuf>,
    },

    /// Run the given stages and print the monitor report
    Report {
        /// Query to validate
        #[arg(long)]
        query: Option<String>,

        /// Records for the retrieval, context and output stages
        #[arg(short, long)]
        records: Option<PathBuf>,

        /// File with the assembled context
        #[arg(long)]
        context: Option<PathBuf>,

        /// File with the model answer
        #[arg(long)]
        answer: Option<PathBuf>,
    },
}

/// Shared state for one invocation
struct Session {
    config: GuardConfig,
    format: OutputFormat,
    quiet: bool,
    metrics: Arc<GuardMetrics>,
}

impl Session {
    fn emit(&self, render: impl FnOnce(OutputFormat) -> Result<()>) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        render(self.format)
    }

    fn pipeline(
        &self,
        lookup: Arc<dyn ProtocolSource>,
        audit: AuditEmitter,
    ) -> Result<ValidationPipeline> {
        Ok(ValidationPipeline::new(lookup)
            .with_vocabulary(Arc::new(self.config.vocabulary()?))
            .with_formulary(Arc::new(self.config.formulary()?))
            .with_metrics(Arc::clone(&self.metrics))
            .with_audit(audit))
    }

    /// Run one stage over `records` on a pipeline whose lookup is the records themselves
    async fn validate_against(
        &self,
        records: &[ProtocolRecord],
        run: impl FnOnce(&ValidationPipeline) -> ValidationResult,
    ) -> Result<ValidationResult> {
        let (audit, worker) = self.audit();
        let pipeline = self.pipeline(
            Arc::new(FileProtocolIndex::from_records(records.to_vec())),
            audit,
        )?;
        let result = run(&pipeline);
        drop(pipeline);
        worker.join().await;
        Ok(result)
    }

    fn print_metrics(&self, requested: bool) -> Result<()> {
        if requested && !self.quiet {
            print!("{}", self.metrics.encode_text()?);
        }
        Ok(())
    }

    fn index_path(&self, explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| self.config.paths.local_index.clone())
    }

    fn audit(&self) -> (AuditEmitter, AuditWorker) {
        match &self.config.paths.audit_log {
            Some(path) => AuditEmitter::spawn(JsonlAuditSink::new(path), AUDIT_QUEUE_SIZE),
            None => AuditEmitter::spawn(TracingAuditSink, AUDIT_QUEUE_SIZE),
        }
    }

    fn coordinator(
        &self,
        store: &Path,
        index: Option<PathBuf>,
        audit: AuditEmitter,
    ) -> Result<RetrievalCoordinator> {
        let primary: Arc<dyn ProtocolSource> = Arc::new(load_index(store)?.with_name("store"));
        let mut builder = RetrievalCoordinator::builder(primary)
            .core_config(&self.config.core)
            .audit(audit);
        if let Some(path) = self.index_path(index) {
            builder = builder.local_index(FileIndexLoader::new(path));
        }
        Ok(builder.build())
    }
}

/// Dispatch a parsed command
pub async fn execute(cli: GuardCli) -> Result<ExitCode> {
    execute_with_metrics(cli, Arc::new(GuardMetrics::new()?)).await
}

/// Dispatch a parsed command, recording into `metrics`
pub async fn execute_with_metrics(cli: GuardCli, metrics: Arc<GuardMetrics>) -> Result<ExitCode> {
    let session = Session {
        config: GuardConfig::resolve(cli.config.as_deref())?,
        format: cli.format,
        quiet: cli.quiet,
        metrics,
    };

    let exit = match cli.command {
        GuardCommands::Query { text, index } => execute_query(&session, &text, index).await,
        GuardCommands::Records { records } => {
            let records = load_records(&records)?;
            let result = session
                .validate_against(&records, |p| p.validate_retrieved_records(&records))
                .await?;
            finish_validation(&session, "retrieval", &result)
        }
        GuardCommands::Context { input, records } => {
            let text = input.read()?;
            let records = load_records(&records)?;
            let result = session
                .validate_against(&records, |p| p.validate_assembled_context(&text, &records))
                .await?;
            finish_validation(&session, "context", &result)
        }
        GuardCommands::Output { input, records } => {
            let text = input.read()?;
            let records = load_records(&records)?;
            let result = session
                .validate_against(&records, |p| p.validate_output(&text, &records))
                .await?;
            finish_validation(&session, "output", &result)
        }
        GuardCommands::Retrieve {
            code,
            search,
            store,
            index,
            limit,
        } => execute_retrieve(&session, code, search, &store, index, limit).await,
        GuardCommands::Health { store, index } => execute_health(&session, &store, index).await,
        GuardCommands::Report {
            query,
            records,
            context,
            answer,
        } => execute_report(&session, query, records, context, answer).await,
    }?;

    session.print_metrics(cli.metrics)?;
    Ok(exit)
}

async fn execute_query(session: &Session, text: &str, index: Option<PathBuf>) -> Result<ExitCode> {
    if text.trim().is_empty() {
        return Err(GuardError::invalid_input("query text is empty"));
    }
    let path = session.index_path(index).ok_or_else(|| {
        GuardError::invalid_input("query validation needs a protocol index (--index or paths.local_index)")
    })?;
    let lookup = Arc::new(load_index(&path)?);
    let (audit, worker) = session.audit();
    let pipeline = session.pipeline(lookup, audit)?;
    let result = pipeline.validate_query(text).await;
    drop(pipeline);
    worker.join().await;
    finish_validation(session, "query", &result)
}

async fn execute_retrieve(
    session: &Session,
    code: Option<String>,
    search: Option<String>,
    store: &Path,
    index: Option<PathBuf>,
    limit: usize,
) -> Result<ExitCode> {
    let (audit, worker) = session.audit();
    let coordinator = session.coordinator(store, index, audit)?;

    let exit = match (code, search) {
        (Some(code), _) => {
            let result = coordinator.retrieve_with_fallback(&code).await;
            session.metrics.observe_recovery(&result, &coordinator);
            session.emit(|format| output::render_retrieval(&result, format))?;
            retrieval_exit(result.success, result.is_degraded())
        }
        (None, Some(query)) => {
            let options = SearchOptions::default().with_limit(limit);
            let result = coordinator.search_with_fallback(&query, &options).await;
            session.metrics.observe_recovery(&result, &coordinator);
            session.emit(|format| output::render_search(&result, format))?;
            retrieval_exit(result.success, result.is_degraded())
        }
        (None, None) => return Err(GuardError::invalid_input("give a protocol code or --search")),
    };

    drop(coordinator);
    worker.join().await;
    Ok(exit)
}

fn retrieval_exit(success: bool, degraded: bool) -> ExitCode {
    ExitCode::from_validation_result(!success, degraded)
}

async fn execute_health(session: &Session, store: &Path, index: Option<PathBuf>) -> Result<ExitCode> {
    let (audit, worker) = session.audit();
    let coordinator = session.coordinator(store, index, audit)?;
    let report = coordinator.health_check(&session.config.core.health).await;
    session.metrics.observe_circuits(&coordinator);
    session.emit(|format| output::render_health(&report, format))?;

    drop(coordinator);
    worker.join().await;

    Ok(match report.status {
        HealthStatus::Healthy => ExitCode::Success,
        HealthStatus::Degraded => ExitCode::ValidationWarning,
        HealthStatus::Unhealthy => ExitCode::ValidationError,
    })
}

async fn execute_report(
    session: &Session,
    query: Option<String>,
    records: Option<PathBuf>,
    context: Option<PathBuf>,
    answer: Option<PathBuf>,
) -> Result<ExitCode> {
    let records = match &records {
        Some(path) => load_records(path)?,
        None => Vec::new(),
    };
    let lookup: Arc<dyn ProtocolSource> = match session.index_path(None) {
        Some(path) => Arc::new(load_index(&path)?),
        None => Arc::new(FileProtocolIndex::from_records(records.clone())),
    };

    let monitor = Arc::new(ValidationMonitor::new(session.config.monitor.clone()));
    let (audit, worker) = session.audit();
    let pipeline = session
        .pipeline(lookup, audit)?
        .with_monitor(Arc::clone(&monitor));

    let mut ran = 0;
    if let Some(query) = &query {
        pipeline.validate_query(query).await;
        ran += 1;
    }
    if !records.is_empty() {
        pipeline.validate_retrieved_records(&records);
        ran += 1;
    }
    if let Some(path) = &context {
        pipeline.validate_assembled_context(&read_text(path)?, &records);
        ran += 1;
    }
    if let Some(path) = &answer {
        pipeline.validate_output(&read_text(path)?, &records);
        ran += 1;
    }
    drop(pipeline);
    worker.join().await;
    if ran == 0 {
        return Err(GuardError::invalid_input(
            "nothing to validate: give --query, --records, --context or --answer",
        ));
    }

    let report = monitor.generate_report(None);
    session.emit(|format| output::render_report(&report, format))?;

    Ok(if report.meets_target {
        ExitCode::Success
    } else {
        ExitCode::ValidationError
    })
}

fn finish_validation(session: &Session, stage: &str, result: &ValidationResult) -> Result<ExitCode> {
    session.emit(|format| output::ValidationOutput::from_result(stage, result).render(format))?;
    Ok(ExitCode::from_validation_result(!result.valid, result.has_warnings()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| GuardError::file_error(format!("Failed to read '{}': {}", path.display(), e)))
}

fn load_index(path: &Path) -> Result<FileProtocolIndex> {
    if !path.exists() {
        return Err(GuardError::file_error(format!(
            "Protocol file '{}' does not exist",
            path.display()
        )));
    }
    FileProtocolIndex::from_file(path).map_err(|e| {
        GuardError::parse_error(format!("Failed to load protocols from '{}': {}", path.display(), e))
    })
}

fn load_records(path: &Path) -> Result<Vec<ProtocolRecord>> {
    Ok(load_index(path)?.records().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::ValidationStage;

    #[test]
    fn test_parse_query_command() {
        let cli = GuardCli::parse_from(["protocol-guard", "query", "epi dose 1210", "--index", "p.json"]);
        match cli.command {
            GuardCommands::Query { text, index } => {
                assert_eq!(text, "epi dose 1210");
                assert_eq!(index, Some(PathBuf::from("p.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.format, OutputFormat::Table);
    }

    #[test]
    fn test_parse_output_command_with_globals() {
        let cli = GuardCli::parse_from([
            "protocol-guard",
            "-vv",
            "--format",
            "json",
            "output",
            "--text",
            "Give epinephrine 1 mg IV",
            "--records",
            "records.json",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, GuardCommands::Output { .. }));
    }

    #[test]
    fn test_text_input_is_required() {
        let parsed = GuardCli::try_parse_from(["protocol-guard", "context", "--records", "r.json"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_retrieve_needs_code_or_search() {
        assert!(GuardCli::try_parse_from(["protocol-guard", "retrieve", "--store", "s.json"]).is_err());
        assert!(GuardCli::try_parse_from([
            "protocol-guard",
            "retrieve",
            "--store",
            "s.json",
            "--search",
            "cardiac arrest"
        ])
        .is_ok());
    }

    fn bundled_protocols() -> String {
        format!("{}/data/protocols.json", env!("CARGO_MANIFEST_DIR"))
    }

    #[tokio::test]
    async fn test_retrieve_feeds_retrieval_metrics() {
        let store = bundled_protocols();
        let cli = GuardCli::parse_from(["protocol-guard", "-q", "--metrics", "retrieve", "1210", "--store", &store]);
        assert!(cli.metrics);

        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let exit = execute_with_metrics(cli, Arc::clone(&metrics)).await.unwrap();

        assert_eq!(exit, ExitCode::Success);
        assert_eq!(metrics.retrievals("primary", true), 1.0);
        assert_eq!(metrics.open_circuits(), 0.0);
    }

    #[tokio::test]
    async fn test_output_command_records_validation() {
        let records = bundled_protocols();
        let cli = GuardCli::parse_from([
            "protocol-guard",
            "-q",
            "output",
            "--text",
            "Per 9999, give epinephrine 1 mg IV.",
            "--records",
            &records,
        ]);

        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let exit = execute_with_metrics(cli, Arc::clone(&metrics)).await.unwrap();

        assert_eq!(exit, ExitCode::ValidationError);
        assert_eq!(metrics.validations(ValidationStage::Output, false), 1.0);
        assert_eq!(
            metrics.findings(ValidationStage::Output, "critical", "HALLUCINATED_CITATION"),
            1.0
        );
    }

    #[test]
    fn test_missing_index_is_file_error() {
        let err = load_index(Path::new("/nonexistent/protocols.json")).unwrap_err();
        assert!(err.is_file_error());
    }
}
