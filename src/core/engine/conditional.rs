//! Conditional strategy: evaluate a condition, run one of two branches.
//!
//! The chosen branch executes sequentially, so a branch task may
//! reference the output of an earlier sibling. Failures are absorbed into
//! the aggregate exactly like the parallel strategy, and `retry_failed`
//! follows the same rules.
use super::sequential::{self};
use super::{StrategyContext, StrategyOutput, parallel};
use crate::Result;
use crate::core::evaluator::{self, EvalContext};
use crate::core::task::Task;
use crate::core::variables::{ExpandSite, VariableEngine};
use crate::error::TaskerError;
use std::time::Instant;

pub async fn execute(task: &Task, ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
    let start = Instant::now();

    let condition = task
        .condition
        .as_deref()
        .ok_or_else(|| TaskerError::internal(format!("task {} has no condition", task.id)))?;
    let branch_taken = evaluate_condition(condition, ctx)?;
    let branch = if branch_taken {
        &task.if_true_tasks
    } else {
        &task.if_false_tasks
    };
    log::debug!(
        "task {}: condition is {}, dispatching {} branch task(s)",
        task.id,
        branch_taken,
        branch.len()
    );

    // Branch siblings run in order and may reference each other's
    // results, so each plan is built against a locally advanced view.
    let mut local_results = ctx.results.clone();
    let mut subtask_results = Vec::with_capacity(branch.len());
    for id in branch {
        let subtask = ctx.tasks.get(id).ok_or_else(|| {
            TaskerError::internal(format!(
                "task {}: branch task {} missing after validation",
                task.id, id
            ))
        })?;
        let local_ctx = StrategyContext {
            results: &local_results,
            ..*ctx
        };
        let plans = parallel::subtask_plans(task, std::slice::from_ref(id), &local_ctx)?;
        let plan = plans.into_iter().next().expect("one plan per id");
        let result = sequential::run_attempts(
            &plan,
            ctx.settings,
            ctx.registry,
            ctx.cancel,
            |attempt| {
                for observer in ctx.observers {
                    observer.on_retry(subtask, attempt);
                }
            },
        )
        .await?;
        local_results.record_subtask(result.clone());
        subtask_results.push(result);
    }

    let result = parallel::aggregate_result(
        task,
        branch,
        &subtask_results,
        start.elapsed().as_secs_f64(),
        ctx,
    )?;
    Ok(StrategyOutput {
        result,
        subtask_results,
    })
}

/// Expand and evaluate a condition expression. Stream and exit atoms see
/// the most recently completed task's result.
pub(super) fn evaluate_condition(condition: &str, ctx: &StrategyContext<'_>) -> Result<bool> {
    let engine = VariableEngine::new(
        ctx.tasks,
        ctx.globals,
        ctx.results,
        ctx.registry,
        ctx.settings,
    );
    let expression = engine.expand(condition, ExpandSite::Expression)?.value;
    let eval_ctx = match ctx.results.last_completed() {
        Some(result) => EvalContext::for_result(result),
        None => EvalContext::empty(),
    };
    evaluator::evaluate_str(&expression, &eval_ctx)
}
