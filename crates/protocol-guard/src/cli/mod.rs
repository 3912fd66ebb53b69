//! Command-line interface
//!
//! Runs individual validation stages over files, exercises the retrieval
//! cascade against a file-backed store and prints health and monitor
//! reports.

pub mod commands;
pub mod output;

pub use commands::{GuardCli, GuardCommands, TextInput};
pub use output::{OutputFormat, ValidationOutput};

use crate::error::{GuardError, Result};

/// Exit codes for CLI operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful execution, all validations passed
    Success = 0,
    /// Validation failed with errors (or retrieval failed, or unhealthy)
    ValidationError = 1,
    /// Passed with warnings (or a degraded answer)
    ValidationWarning = 2,
    /// Invalid input or arguments
    InvalidInput = 3,
    /// File not found or inaccessible
    FileError = 4,
    /// Internal error
    InternalError = 10,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    pub fn from_validation_result(has_errors: bool, has_warnings: bool) -> Self {
        if has_errors {
            ExitCode::ValidationError
        } else if has_warnings {
            ExitCode::ValidationWarning
        } else {
            ExitCode::Success
        }
    }

    /// Exit code for a failed invocation
    pub fn from_error(err: &GuardError) -> Self {
        if err.is_file_error() {
            ExitCode::FileError
        } else if err.is_user_error() {
            ExitCode::InvalidInput
        } else {
            ExitCode::InternalError
        }
    }
}

/// Run the CLI on a fresh current-thread runtime
pub fn run(cli: GuardCli) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| GuardError::InternalError(format!("failed to start runtime: {}", e)))?;
    runtime.block_on(commands::execute(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_conversion() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::ValidationError), 1);
        assert_eq!(i32::from(ExitCode::ValidationWarning), 2);
        assert_eq!(i32::from(ExitCode::InternalError), 10);
    }

    #[test]
    fn test_exit_code_from_validation_result() {
        assert_eq!(ExitCode::from_validation_result(false, false), ExitCode::Success);
        assert_eq!(ExitCode::from_validation_result(true, false), ExitCode::ValidationError);
        assert_eq!(ExitCode::from_validation_result(false, true), ExitCode::ValidationWarning);
        assert_eq!(ExitCode::from_validation_result(true, true), ExitCode::ValidationError);
    }

    #[test]
    fn test_exit_code_from_error() {
        assert_eq!(ExitCode::from_error(&GuardError::file_error("x")), ExitCode::FileError);
        assert_eq!(ExitCode::from_error(&GuardError::invalid_input("x")), ExitCode::InvalidInput);
        assert_eq!(
            ExitCode::from_error(&GuardError::InternalError("x".into())),
            ExitCode::InternalError
        );
    }
}
