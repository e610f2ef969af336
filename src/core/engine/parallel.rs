//! Parallel strategy: fan a subtask list out through the worker pool.
//!
//! Each subtask is expanded into an owned plan up front, then executed on
//! its own worker, bounded by the pool built from `max_parallel` and the
//! sizing policy. Per-subtask failures never terminate the workflow; the
//! aggregate's success criterion decides.
use super::sequential::{self, ExecutionPlan, cancellation_error};
use super::{StrategyContext, StrategyOutput};
use crate::Result;
use crate::core::evaluator::{self, EvalContext};
use crate::core::results::{Aggregate, TaskResult};
use crate::core::scheduler::WorkerPool;
use crate::core::task::Task;
use crate::core::variables::{ExpandSite, VariableEngine};
use crate::error::TaskerError;
use std::sync::Arc;
use std::time::Instant;

pub async fn execute(task: &Task, ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
    let start = Instant::now();
    let plans = subtask_plans(task, &task.subtask_ids, ctx)?;

    let requested = task.max_parallel.unwrap_or_else(|| plans.len().max(1));
    let pool = WorkerPool::new(requested, ctx.policy, ctx.cancel.clone());
    log::debug!(
        "task {}: dispatching {} subtasks on a pool of {}",
        task.id,
        plans.len(),
        pool.size()
    );

    let mut handles = Vec::with_capacity(plans.len());
    for plan in plans {
        let pool = pool.clone();
        let settings = ctx.settings.clone();
        let registry = Arc::clone(ctx.registry);
        let cancel = ctx.cancel.clone();
        handles.push(tokio::spawn(async move {
            let Some(_permit) = pool.acquire().await else {
                return Err(cancellation_error(&cancel));
            };
            sequential::run_attempts(&plan, &settings, &registry, &cancel, |attempt| {
                log::info!("subtask {} retry attempt {}", plan.task_id, attempt);
            })
            .await
        }));
    }

    let mut subtask_results = Vec::with_capacity(handles.len());
    for joined in futures::future::join_all(handles).await {
        let result = joined
            .map_err(|e| TaskerError::internal(format!("worker panicked: {}", e)))??;
        subtask_results.push(result);
    }

    let result = aggregate_result(
        task,
        &task.subtask_ids,
        &subtask_results,
        start.elapsed().as_secs_f64(),
        ctx,
    )?;
    Ok(StrategyOutput {
        result,
        subtask_results,
    })
}

/// Expand every subtask into an owned plan. Retry behavior comes from the
/// aggregate task: `retry_failed` grants each subtask the aggregate's
/// retry budget, otherwise subtasks run exactly once.
pub(super) fn subtask_plans(
    aggregate: &Task,
    subtask_ids: &[u32],
    ctx: &StrategyContext<'_>,
) -> Result<Vec<ExecutionPlan>> {
    let mut plans = Vec::with_capacity(subtask_ids.len());
    for id in subtask_ids {
        let subtask = ctx.tasks.get(id).ok_or_else(|| {
            TaskerError::internal(format!(
                "task {}: subtask {} missing after validation",
                aggregate.id, id
            ))
        })?;
        let mut plan = sequential::plan(subtask, ctx.results, ctx)?;
        if aggregate.retry_failed {
            plan.retry_count = aggregate.retry_count;
            plan.retry_delay = std::time::Duration::from_secs_f64(aggregate.retry_delay_seconds);
        } else {
            plan.retry_count = 0;
        }
        plans.push(plan);
    }
    Ok(plans)
}

/// Fold subtask results into the aggregate counters and judge the
/// aggregate's success criterion (default `all_success`).
pub(super) fn aggregate_result(
    task: &Task,
    subtask_order: &[u32],
    subtask_results: &[TaskResult],
    duration_seconds: f64,
    ctx: &StrategyContext<'_>,
) -> Result<TaskResult> {
    let mut counters = Aggregate {
        total: subtask_results.len(),
        ..Aggregate::default()
    };
    for result in subtask_results {
        if result.success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
            if result.timed_out {
                counters.timed_out += 1;
            }
        }
    }

    let engine = VariableEngine::new(
        ctx.tasks,
        ctx.globals,
        ctx.results,
        ctx.registry,
        ctx.settings,
    );
    let expression = match task.success.as_deref() {
        Some(expression) => engine.expand(expression, ExpandSite::Expression)?.value,
        None => "all_success".to_string(),
    };
    let eval_ctx = EvalContext {
        aggregate: Some(&counters),
        ..EvalContext::empty()
    };
    let success = evaluator::evaluate_str(&expression, &eval_ctx)?;

    Ok(TaskResult::aggregate(
        task.id,
        subtask_order.to_vec(),
        counters,
        success,
        duration_seconds,
    ))
}
