//! Protocol Guard
//!
//! Four-stage validation around a language-model answer about clinical
//! protocols, plus the monitoring and CLI built on top of it. Retrieval
//! itself lives in [`protocol_guard_core`], re-exported here.
//!
//! ## Stages
//!
//! 1. **Query** - normalizes abbreviations, checks cited protocol codes exist,
//!    flags vague or off-formulary questions
//! 2. **Retrieval** - rejects superseded, expired or truncated records
//! 3. **Context** - checks citations, doses and base hospital contact in the
//!    assembled model input
//! 4. **Output** - catches hallucinated citations, unsafe doses and
//!    self-contradictions in the answer
//!
//! Findings are data: a stage never fails. A critical finding in stage 4
//! means the answer must be discarded.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use protocol_guard::{ValidationPipeline, ValidationMonitor};
//!
//! let monitor = Arc::new(ValidationMonitor::default());
//! let pipeline = ValidationPipeline::new(lookup).with_monitor(monitor.clone());
//!
//! let result = pipeline.validate_output(&answer, &records);
//! if result.must_suppress() {
//!     // fall back to a safe refusal
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod finding;
pub mod formulary;
pub mod metrics;
pub mod monitor;
pub mod stages;
pub mod vocabulary;

pub use protocol_guard_core;

pub use cli::{ExitCode, GuardCli, OutputFormat};
pub use config::{GuardConfig, PathsConfig};
pub use error::{GuardError, Result};
pub use extract::DoseMention;
pub use finding::{Severity, ValidationFinding, ValidationResult, ValidationStage};
pub use formulary::{DoseCheck, DoseRange, DoseUnit, Formulary, Route};
pub use metrics::GuardMetrics;
pub use monitor::{ErrorPattern, MonitorConfig, MonitorMetrics, MonitorReport, ValidationEvent, ValidationMonitor};
pub use stages::ValidationPipeline;
pub use vocabulary::Vocabulary;

/// Run the CLI and map the outcome to an exit code
///
/// ```rust,no_run
/// use clap::Parser;
/// use protocol_guard::{GuardCli, run_cli};
///
/// fn main() {
///     let cli = GuardCli::parse();
///     let exit_code = run_cli(cli);
///     std::process::exit(exit_code.into());
/// }
/// ```
pub fn run_cli(cli: GuardCli) -> ExitCode {
    match cli::run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from_error(&e)
        }
    }
}
