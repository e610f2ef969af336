//! Workflow execution engine.
//!
//! The engine is a computed goto over task ids: a cursor walks the
//! declared order, each task is dispatched to the strategy matching its
//! kind, and the routing rules pick the next cursor. Loops are bounded by
//! an explicit iteration counter, never recursion, which keeps the stack
//! flat and cancellation trivial.
//!
//! Routing precedence: explicit `on_success` / `on_failure` targets win
//! over the `next` keyword, which wins over declaration-order
//! fall-through.
pub mod executor;

mod conditional;
mod decision;
mod parallel;
mod sequential;

use crate::core::evaluator::{self, EvalContext};
use crate::core::output::{CaptureSettings, CleanupRegistry};
use crate::core::results::{TaskResult, TaskResults};
use crate::core::scheduler::{CancelControl, PoolPolicy};
use crate::core::task::{GlobalVariables, NextRule, Task, TaskKind};
use crate::error::{CancelSignal, TaskerError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit code of a workflow terminated by `next=never`.
pub const SUCCESS_NEVER_EXIT_CODE: i32 = 5;
/// Exit code of an unrouted aggregate failure.
pub const CONDITIONAL_FAILURE_EXIT_CODE: i32 = 14;

/// Hooks for the logging and recovery sinks. Every callback observes a
/// completed state transition; none of them may fail the workflow.
pub trait WorkflowObserver: Send + Sync {
    fn on_task_start(&self, _task: &Task) {}
    fn on_task_complete(&self, _task: &Task, _result: &TaskResult) {}
    fn on_task_skipped(&self, _task: &Task) {}
    fn on_retry(&self, _task: &Task, _attempt: u32) {}
}

/// Everything a strategy needs, borrowed from the engine for one
/// dispatch.
pub(crate) struct StrategyContext<'a> {
    pub tasks: &'a BTreeMap<u32, Task>,
    pub globals: &'a GlobalVariables,
    pub results: &'a TaskResults,
    pub registry: &'a Arc<CleanupRegistry>,
    pub settings: &'a CaptureSettings,
    pub cancel: &'a CancelControl,
    pub policy: &'a PoolPolicy,
    pub observers: &'a [Arc<dyn WorkflowObserver>],
}

/// What a strategy hands back: the task's own result plus any subtask
/// results to record under their own ids.
pub(crate) struct StrategyOutput {
    pub result: TaskResult,
    pub subtask_results: Vec<TaskResult>,
}

/// Judge a success criterion (already expanded) against a result.
pub(crate) fn evaluate_success(expression: &str, result: &TaskResult) -> crate::Result<bool> {
    evaluator::evaluate_str(expression, &EvalContext::for_result(result))
}

/// Engine configuration fixed at workflow start.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub capture_settings: CaptureSettings,
    pub policy: PoolPolicy,
    /// Cursor override (`--start-from`).
    pub start_from: Option<u32>,
    /// Workflow-wide master timeout in seconds.
    pub master_timeout: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            capture_settings: CaptureSettings::default(),
            policy: PoolPolicy::from_env(),
            start_from: None,
            master_timeout: None,
        }
    }
}

/// Terminal state of one workflow invocation.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub exit_code: i32,
    pub success: bool,
    /// The last task the cursor pointed at.
    pub final_task_id: Option<u32>,
    pub error: Option<String>,
}

impl WorkflowOutcome {
    fn completed(final_task_id: Option<u32>) -> Self {
        Self {
            exit_code: 0,
            success: true,
            final_task_id,
            error: None,
        }
    }
}

enum Routing {
    Goto(u32),
    NextDeclared,
    Repeat,
    Stop { exit_code: i32, success: bool },
}

/// The workflow execution engine.
pub struct ExecutionEngine {
    tasks: BTreeMap<u32, Task>,
    order: Vec<u32>,
    globals: GlobalVariables,
    results: TaskResults,
    registry: Arc<CleanupRegistry>,
    cancel: CancelControl,
    options: EngineOptions,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    master_timed_out: Arc<AtomicBool>,
}

impl ExecutionEngine {
    /// Build an engine over a validated task list.
    pub fn new(tasks: Vec<Task>, globals: GlobalVariables, options: EngineOptions) -> Self {
        let order: Vec<u32> = tasks.iter().map(|t| t.id).collect();
        let tasks: BTreeMap<u32, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
        Self {
            tasks,
            order,
            globals,
            results: TaskResults::new(),
            registry: Arc::new(CleanupRegistry::new()),
            cancel: CancelControl::new(),
            options,
            observers: Vec::new(),
            master_timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the cancellation fabric, so signal handlers installed by
    /// the command layer reach this workflow.
    pub fn with_cancel(mut self, cancel: CancelControl) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn WorkflowObserver>) {
        self.observers.push(observer);
    }

    pub fn cancel_control(&self) -> CancelControl {
        self.cancel.clone()
    }

    pub fn results(&self) -> &TaskResults {
        &self.results
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }

    pub fn task(&self, id: u32) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Re-hydrate a completed result from a recovery state file.
    pub fn preload_result(&mut self, result: TaskResult) {
        self.results.record_subtask(result);
    }

    /// Drive the workflow to termination. Never panics on task failures;
    /// every terminal state is folded into the outcome.
    pub async fn run(&mut self) -> WorkflowOutcome {
        let mut cursor = match self.start_cursor() {
            Ok(cursor) => cursor,
            Err(outcome) => return outcome,
        };
        let mut loop_counters: HashMap<u32, u32> = HashMap::new();
        let watchdog = self.spawn_master_watchdog();

        let outcome = loop {
            let Some(id) = cursor else {
                break WorkflowOutcome::completed(self.results.execution_path().last().copied());
            };
            if self.cancel.is_cancelled() {
                break self.cancellation_outcome(Some(id));
            }

            let Some(task) = self.tasks.get(&id).cloned() else {
                break self.error_outcome(
                    TaskerError::internal(format!("cursor points at unknown task {}", id)),
                    Some(id),
                );
            };

            if task.kind == TaskKind::Return {
                let exit_code = task.return_code_override.unwrap_or(0);
                log::info!("task {}: return, workflow exits {}", id, exit_code);
                break WorkflowOutcome {
                    exit_code,
                    success: exit_code == 0,
                    final_task_id: Some(id),
                    error: None,
                };
            }

            // Skip gate. Conditional tasks consume their condition for
            // branch selection; a decision's condition gates only when a
            // separate success predicate exists.
            let gate = match task.kind {
                TaskKind::Conditional => None,
                TaskKind::Decision if task.success.is_none() => None,
                _ => task.condition.as_deref(),
            };
            if let Some(condition) = gate {
                let verdict = {
                    let ctx = self.strategy_context();
                    conditional::evaluate_condition(condition, &ctx)
                };
                match verdict {
                    Ok(true) => {}
                    Ok(false) => {
                        log::info!("task {}: condition false, skipped", id);
                        for observer in &self.observers {
                            observer.on_task_skipped(&task);
                        }
                        cursor = self.next_declared(id);
                        continue;
                    }
                    Err(e) => break self.error_outcome(e, Some(id)),
                }
            }

            for observer in &self.observers {
                observer.on_task_start(&task);
            }

            let dispatched = {
                let ctx = self.strategy_context();
                match task.kind {
                    TaskKind::Sequential => {
                        sequential::execute(&task, &ctx).await.map(|result| {
                            StrategyOutput {
                                result,
                                subtask_results: Vec::new(),
                            }
                        })
                    }
                    TaskKind::Parallel => parallel::execute(&task, &ctx).await,
                    TaskKind::Conditional => conditional::execute(&task, &ctx).await,
                    TaskKind::Decision => decision::execute(&task, &ctx).map(|result| {
                        StrategyOutput {
                            result,
                            subtask_results: Vec::new(),
                        }
                    }),
                    TaskKind::Return => unreachable!("return handled above"),
                }
            };
            let output = match dispatched {
                Ok(output) => output,
                Err(e) => break self.error_outcome(e, Some(id)),
            };

            for subtask_result in output.subtask_results {
                self.results.record_subtask(subtask_result);
            }
            let result = output.result;
            self.results.record(result.clone());
            for observer in &self.observers {
                observer.on_task_complete(&task, &result);
            }
            log::info!(
                "task {}: {} (exit {}, {:.3}s)",
                id,
                result.status_label(),
                result.exit_code,
                result.duration_seconds
            );

            cursor = match self.route(&task, &result, &mut loop_counters) {
                Ok(Routing::Goto(target)) => Some(target),
                Ok(Routing::NextDeclared) => self.next_declared(id),
                Ok(Routing::Repeat) => Some(id),
                Ok(Routing::Stop { exit_code, success }) => {
                    break WorkflowOutcome {
                        exit_code,
                        success,
                        final_task_id: Some(id),
                        error: (!success).then(|| format!("task {} failed", id)),
                    };
                }
                Err(e) => break self.error_outcome(e, Some(id)),
            };

            if let Some(seconds) = task.sleep_seconds {
                if seconds > 0.0 {
                    log::debug!("task {}: sleeping {}s before advancing", id, seconds);
                    let token = self.cancel.token();
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)) => {}
                        _ = token.cancelled() => {}
                    }
                }
            }
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        outcome
    }

    fn start_cursor(&self) -> Result<Option<u32>, WorkflowOutcome> {
        if self.order.is_empty() {
            return Err(WorkflowOutcome {
                exit_code: 24,
                success: false,
                final_task_id: None,
                error: Some("no tasks to execute".to_string()),
            });
        }
        match self.options.start_from {
            Some(id) if self.tasks.contains_key(&id) => Ok(Some(id)),
            Some(id) => Err(WorkflowOutcome {
                exit_code: 20,
                success: false,
                final_task_id: None,
                error: Some(format!("start task {} is not declared", id)),
            }),
            None => Ok(self.order.first().copied()),
        }
    }

    fn spawn_master_watchdog(&self) -> Option<tokio::task::JoinHandle<()>> {
        let seconds = self.options.master_timeout?;
        let cancel = self.cancel.clone();
        let fired = Arc::clone(&self.master_timed_out);
        Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            log::warn!("master timeout of {}s reached, cancelling workflow", seconds);
            fired.store(true, Ordering::SeqCst);
            cancel.cancel(None);
        }))
    }

    fn strategy_context(&self) -> StrategyContext<'_> {
        StrategyContext {
            tasks: &self.tasks,
            globals: &self.globals,
            results: &self.results,
            registry: &self.registry,
            settings: &self.options.capture_settings,
            cancel: &self.cancel,
            policy: &self.options.policy,
            observers: &self.observers,
        }
    }

    fn next_declared(&self, id: u32) -> Option<u32> {
        let position = self.order.iter().position(|&candidate| candidate == id)?;
        self.order.get(position + 1).copied()
    }

    fn route(
        &self,
        task: &Task,
        result: &TaskResult,
        loop_counters: &mut HashMap<u32, u32>,
    ) -> crate::Result<Routing> {
        // Explicit routing wins over the next keyword.
        if result.success {
            if let Some(target) = task.on_success {
                return Ok(Routing::Goto(target));
            }
        } else if let Some(target) = task.on_failure {
            return Ok(Routing::Goto(target));
        }

        match task.next {
            None | Some(NextRule::Success) => Ok(self.default_advance(task, result)),
            Some(NextRule::Always) => Ok(Routing::NextDeclared),
            Some(NextRule::Never) => {
                if result.success {
                    Ok(Routing::Stop {
                        exit_code: SUCCESS_NEVER_EXIT_CODE,
                        success: true,
                    })
                } else {
                    Ok(self.default_advance(task, result))
                }
            }
            Some(NextRule::Loop) => {
                let loop_count = task.loop_count.ok_or_else(|| {
                    TaskerError::internal(format!("task {}: next=loop without loop count", task.id))
                })?;
                if task.loop_break && result.success {
                    return Ok(Routing::NextDeclared);
                }
                let iteration = loop_counters.entry(task.id).or_insert(1);
                if *iteration < loop_count {
                    *iteration += 1;
                    log::debug!(
                        "task {}: loop iteration {}/{}",
                        task.id,
                        *iteration,
                        loop_count
                    );
                    Ok(Routing::Repeat)
                } else {
                    Ok(self.default_advance(task, result))
                }
            }
            Some(
                NextRule::AllSuccess
                | NextRule::AnySuccess
                | NextRule::MajoritySuccess
                | NextRule::MinSuccess(_),
            ) => {
                if !result.success {
                    return Ok(self.default_advance(task, result));
                }
                let aggregate = result.aggregate.ok_or_else(|| {
                    TaskerError::expression(format!(
                        "task {}: aggregate next keyword on a non-aggregate result",
                        task.id
                    ))
                })?;
                let advance = match task.next {
                    Some(NextRule::AllSuccess) => {
                        aggregate.total > 0 && aggregate.succeeded == aggregate.total
                    }
                    Some(NextRule::AnySuccess) => aggregate.succeeded > 0,
                    Some(NextRule::MajoritySuccess) => {
                        aggregate.percent_succeeded()
                            >= evaluator::DEFAULT_MAJORITY_PERCENT
                    }
                    Some(NextRule::MinSuccess(k)) => aggregate.succeeded >= k as usize,
                    _ => unreachable!(),
                };
                if advance {
                    Ok(Routing::NextDeclared)
                } else {
                    Ok(Routing::Stop {
                        exit_code: CONDITIONAL_FAILURE_EXIT_CODE,
                        success: false,
                    })
                }
            }
        }
    }

    /// The default rule: advance on success, stop failing otherwise.
    fn default_advance(&self, task: &Task, result: &TaskResult) -> Routing {
        if result.success {
            Routing::NextDeclared
        } else {
            let exit_code = match task.kind {
                TaskKind::Parallel | TaskKind::Conditional => CONDITIONAL_FAILURE_EXIT_CODE,
                _ => 1,
            };
            Routing::Stop {
                exit_code,
                success: false,
            }
        }
    }

    fn error_outcome(&self, error: TaskerError, final_task_id: Option<u32>) -> WorkflowOutcome {
        if self.cancel.is_cancelled() {
            return self.cancellation_outcome(final_task_id);
        }
        WorkflowOutcome {
            exit_code: error.exit_code(),
            success: false,
            final_task_id,
            error: Some(error.user_friendly_message()),
        }
    }

    fn cancellation_outcome(&self, final_task_id: Option<u32>) -> WorkflowOutcome {
        if self.master_timed_out.load(Ordering::SeqCst) {
            let seconds = self.options.master_timeout.unwrap_or(0);
            let error = TaskerError::WorkflowTimeout { seconds };
            return WorkflowOutcome {
                exit_code: error.exit_code(),
                success: false,
                final_task_id,
                error: Some(error.to_string()),
            };
        }
        let signal = self.cancel.signal().unwrap_or(CancelSignal::Terminate);
        let error = TaskerError::Cancelled { signal };
        WorkflowOutcome {
            exit_code: error.exit_code(),
            success: false,
            final_task_id,
            error: Some(error.to_string()),
        }
    }
}
