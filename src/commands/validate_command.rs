//! Validation command: the default action and `--validate-only`.
use super::load_and_validate;
use crate::Result;
use crate::cli::{Cli, Exit, ui};
use crate::error::TaskerError;

pub fn execute(cli: &Cli) -> Result<Exit> {
    let (parsed, report) = load_and_validate(cli)?;
    ui::render_diagnostics(&report);

    if report.has_errors() {
        return Err(TaskerError::validation(report.summary()));
    }
    ui::print_success(&format!(
        "{}: {} task(s), {} global(s), validation passed",
        cli.task_file.display(),
        parsed.tasks.len(),
        parsed.globals.len()
    ));
    Ok(Exit(0))
}
