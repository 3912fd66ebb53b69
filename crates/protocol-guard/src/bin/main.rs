//! Protocol Guard CLI
//!
//! # Usage
//!
//! ```bash
//! # Validate a query against the local protocol index
//! protocol-guard query "versed dose for seizure per 1231" --index data/protocols.json
//!
//! # Validate a model answer against its source records
//! protocol-guard output --file answer.txt --records retrieved.json --format json
//!
//! # Fetch a protocol through the retrieval cascade
//! protocol-guard retrieve 1210 --store store.json --index data/protocols.json
//!
//! # Health of the retrieval path
//! protocol-guard health --store store.json
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Validation failed with errors, retrieval failed, or unhealthy
//! - 2: Warnings, a degraded answer, or degraded health
//! - 3: Invalid input or arguments
//! - 4: File not found or inaccessible
//! - 10: Internal error

use anyhow::anyhow;
use clap::Parser;
use protocol_guard::{run_cli, GuardCli};
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &GuardCli) -> anyhow::Result<()> {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::WARN,
        (false, 1) => tracing::Level::INFO,
        (false, 2) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let installed = if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

fn main() {
    let cli = GuardCli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("Warning: {:#}", e);
    }

    let exit_code = run_cli(cli);
    std::process::exit(exit_code.into());
}
