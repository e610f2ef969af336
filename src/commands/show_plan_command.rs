//! Plan rendering command (`--show-plan`): validate, draw the graph,
//! execute nothing.
use super::load_and_validate;
use crate::Result;
use crate::cli::{Cli, Exit, ui};
use crate::error::TaskerError;

pub fn execute(cli: &Cli) -> Result<Exit> {
    let (parsed, report) = load_and_validate(cli)?;
    if report.has_errors() {
        ui::render_diagnostics(&report);
        return Err(TaskerError::validation(report.summary()));
    }
    ui::render_plan(&parsed.tasks);
    Ok(Exit(0))
}
