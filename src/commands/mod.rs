//! TASKER command execution module.
//!
//! One `execute()` per top-level CLI operation: validation (the default),
//! workflow execution (`-r`), and plan rendering (`--show-plan`). The
//! shared parse-and-validate front end lives here so every command sees
//! identical diagnostics for the same file.
pub mod run_command;
pub mod show_plan_command;
pub mod validate_command;

use crate::Result;
use crate::cli::Cli;
use crate::core::parser::{self, ParsedFile};
use crate::core::validator::{self, DiagnosticReport, ValidateOptions};
use crate::error::TaskerError;

/// Parse and validate the task file named by the CLI. Returns the parsed
/// file and its full diagnostics report; the caller decides how to
/// render and whether warnings are tolerable.
pub(crate) fn load_and_validate(cli: &Cli) -> Result<(ParsedFile, DiagnosticReport)> {
    let parsed = parser::parse(&cli.task_file)?;
    if parsed.tasks.is_empty() && !parsed.diagnostics.has_errors() {
        return Err(TaskerError::NoTasksFound {
            path: cli.task_file.display().to_string(),
        });
    }
    let options = ValidateOptions {
        skip_security: cli.skip_security_validation,
        skip_probes: cli.skip_host_validation,
    };
    let report = validator::validate(&parsed, &options);
    Ok((parsed, report))
}
