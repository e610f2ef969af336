//! Decision strategy: a pure routing node.
//!
//! Evaluates a predicate over already-recorded results and variables and
//! records the verdict; no child process is ever spawned. The engine then
//! routes through `on_success` / `on_failure` as with any other task.
use super::StrategyContext;
use super::conditional::evaluate_condition;
use crate::Result;
use crate::core::results::TaskResult;
use crate::core::task::Task;
use crate::error::TaskerError;

pub fn execute(task: &Task, ctx: &StrategyContext<'_>) -> Result<TaskResult> {
    let predicate = task
        .success
        .as_deref()
        .or(task.condition.as_deref())
        .ok_or_else(|| {
            TaskerError::internal(format!("decision task {} has no predicate", task.id))
        })?;
    let verdict = evaluate_condition(predicate, ctx)?;
    log::debug!("task {}: decision predicate is {}", task.id, verdict);
    Ok(TaskResult::decision(task.id, verdict))
}
