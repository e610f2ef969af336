//! Sequential strategy: one child process per task.
//!
//! Also home of the field-expansion and attempt-loop machinery the
//! parallel and conditional strategies reuse: subtasks are expanded into
//! an [`ExecutionPlan`] up front so a worker owns everything it needs.
use super::executor::{ChildSpec, SPAWN_FAILURE_EXIT_CODE, run_child};
use super::{StrategyContext, evaluate_success};
use crate::Result;
use crate::core::output::{CaptureSettings, CleanupRegistry, OutputHandle};
use crate::core::results::TaskResult;
use crate::core::scheduler::CancelControl;
use crate::core::task::Task;
use crate::core::variables::{ExpandSite, VariableEngine};
use crate::error::{CancelSignal, TaskerError};
use std::sync::Arc;
use std::time::Duration;

/// Execute a sequential task: expand its fields, spawn the child, judge
/// the success criterion, and retry criterion-failures when configured.
pub async fn execute(task: &Task, ctx: &StrategyContext<'_>) -> Result<TaskResult> {
    let plan = plan(task, ctx.results, ctx)?;
    run_attempts(
        &plan,
        ctx.settings,
        ctx.registry,
        ctx.cancel,
        |attempt| {
            for observer in ctx.observers {
                observer.on_retry(task, attempt);
            }
        },
    )
    .await
}

/// A task's fields after variable expansion, ready to spawn.
#[derive(Debug, Clone)]
pub(super) struct ExecutionPlan {
    pub task_id: u32,
    pub spec: ChildSpec,
    /// Success criterion with variables already expanded.
    pub success_expr: String,
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Some substituted value was cut at the inline budget.
    pub substitution_truncated: bool,
}

/// Expand a task's spawn-relevant fields against `results`, which the
/// conditional strategy advances between branch siblings.
pub(super) fn plan(
    task: &Task,
    results: &crate::core::results::TaskResults,
    ctx: &StrategyContext<'_>,
) -> Result<ExecutionPlan> {
    let engine = VariableEngine::new(ctx.tasks, ctx.globals, results, ctx.registry, ctx.settings);
    let mut truncated = false;
    let mut expand = |input: &str, site: ExpandSite| -> Result<String> {
        let expanded = engine.expand(input, site)?;
        truncated |= expanded.truncated;
        Ok(expanded.value)
    };

    let command = task
        .command
        .as_deref()
        .ok_or_else(|| TaskerError::internal(format!("task {} has no command", task.id)))?;
    let command = expand(command, ExpandSite::Command)?;
    let hostname = match task.hostname.as_deref() {
        Some(hostname) => Some(expand(hostname, ExpandSite::Hostname)?),
        None => None,
    };
    let arguments = match task.arguments.as_deref() {
        Some(arguments) => Some(expand(arguments, ExpandSite::Arguments)?),
        None => None,
    };
    let mut env_overrides = Vec::with_capacity(task.env_overrides.len());
    for (name, value) in &task.env_overrides {
        env_overrides.push((name.clone(), expand(value, ExpandSite::EnvValue)?));
    }
    let success_expr = match task.success.as_deref() {
        Some(expression) => expand(expression, ExpandSite::Expression)?,
        None => "exit_0".to_string(),
    };

    let spec = ChildSpec::assemble(
        task.exec_mode,
        hostname.as_deref(),
        &command,
        arguments.as_deref(),
    )
    .with_env(env_overrides)
    .with_timeout(task.timeout_seconds.map(Duration::from_secs));

    Ok(ExecutionPlan {
        task_id: task.id,
        spec,
        success_expr,
        retry_count: task.retry_count,
        retry_delay: Duration::from_secs_f64(task.retry_delay_seconds),
        substitution_truncated: truncated,
    })
}

/// The attempt loop shared by all executing strategies. The last
/// attempt's result is the reported one; timeouts are never retried
/// because they signal a systemic condition, not a transient fault.
pub(super) async fn run_attempts<F>(
    plan: &ExecutionPlan,
    settings: &CaptureSettings,
    registry: &Arc<CleanupRegistry>,
    cancel: &CancelControl,
    mut on_retry: F,
) -> Result<TaskResult>
where
    F: FnMut(u32),
{
    let attempts = plan.retry_count + 1;

    for attempt in 1..=attempts {
        if attempt > 1 {
            on_retry(attempt);
            if !plan.retry_delay.is_zero() {
                let token = cancel.token();
                tokio::select! {
                    _ = tokio::time::sleep(plan.retry_delay) => {}
                    _ = token.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(cancel_error(cancel));
            }
        }

        let mut result = match run_child(&plan.spec, settings, registry, cancel).await {
            Ok(outcome) => {
                if outcome.cancelled {
                    return Err(cancel_error(cancel));
                }
                let mut result = TaskResult::new(plan.task_id, outcome.exit_code);
                result.timed_out = outcome.timed_out;
                result.signaled = outcome.signaled;
                result.stdout = outcome.stdout;
                result.stderr = outcome.stderr;
                result.duration_seconds = outcome.duration_seconds;
                result
            }
            Err(TaskerError::Spawn { command, message }) => {
                // Spawn failures become ordinary task failures with a
                // sentinel exit code and the reason on stderr.
                let mut result = TaskResult::new(plan.task_id, SPAWN_FAILURE_EXIT_CODE);
                result.stderr = OutputHandle::from_bytes(
                    format!("failed to spawn '{}': {}", command, message).into_bytes(),
                );
                result
            }
            Err(other) => return Err(other),
        };

        result.attempts = attempt;
        result.substitution_truncated = plan.substitution_truncated;
        result.success = evaluate_success(&plan.success_expr, &result)?;

        if result.success || result.timed_out || attempt == attempts {
            return Ok(result);
        }
        log::info!(
            "task {} attempt {}/{} failed (exit {}), retrying",
            plan.task_id,
            attempt,
            attempts,
            result.exit_code
        );
    }
    unreachable!("attempt loop always returns");
}

pub(super) fn cancel_error(cancel: &CancelControl) -> TaskerError {
    TaskerError::Cancelled {
        signal: cancel.signal().unwrap_or(CancelSignal::Terminate),
    }
}

pub(super) use self::cancel_error as cancellation_error;
