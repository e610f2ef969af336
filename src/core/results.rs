//! Task execution results and the workflow-wide results map.
//!
//! Each executed task id owns exactly one [`TaskResult`] slot in
//! [`TaskResults`]. The engine is the single writer; variable expansion,
//! success evaluation, and the reporting sinks only read completed entries.
//! Loop re-execution and retries overwrite the slot with the latest
//! attempt, which is the reported one.
use crate::core::output::OutputHandle;
use std::collections::HashMap;

/// Exit-code sentinel recorded when a task hit its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Aggregate counters of a parallel or conditional task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aggregate {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl Aggregate {
    /// Fraction of subtasks that succeeded, in [0, 1]. Zero when empty.
    pub fn ratio_succeeded(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    /// Percentage form of [`Aggregate::ratio_succeeded`], in [0, 100].
    pub fn percent_succeeded(&self) -> f64 {
        self.ratio_succeeded() * 100.0
    }
}

/// The recorded outcome of one task execution.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: u32,
    /// Child exit code; 124 when the task timed out.
    pub exit_code: i32,
    /// The per-task timeout fired.
    pub timed_out: bool,
    /// The child died to a signal other than the timeout ladder.
    pub signaled: bool,
    pub stdout: OutputHandle,
    pub stderr: OutputHandle,
    pub duration_seconds: f64,
    /// Verdict of the task's success criterion.
    pub success: bool,
    /// Execution attempts consumed, including the first.
    pub attempts: u32,
    /// A variable substituted into this task's fields was cut at the
    /// inline budget.
    pub substitution_truncated: bool,
    /// Ordered subtask ids of an aggregate result.
    pub subtask_order: Vec<u32>,
    /// Aggregate counters, present for parallel/conditional tasks.
    pub aggregate: Option<Aggregate>,
}

impl TaskResult {
    /// Result shell for a task that ran a child.
    pub fn new(task_id: u32, exit_code: i32) -> Self {
        Self {
            task_id,
            exit_code,
            timed_out: false,
            signaled: false,
            stdout: OutputHandle::empty(),
            stderr: OutputHandle::empty(),
            duration_seconds: 0.0,
            success: false,
            attempts: 1,
            substitution_truncated: false,
            subtask_order: Vec::new(),
            aggregate: None,
        }
    }

    /// Result of a decision node: no child, no output, just a verdict.
    pub fn decision(task_id: u32, success: bool) -> Self {
        let mut result = Self::new(task_id, if success { 0 } else { 1 });
        result.success = success;
        result
    }

    /// Aggregate result of a parallel/conditional task.
    pub fn aggregate(
        task_id: u32,
        subtask_order: Vec<u32>,
        counters: Aggregate,
        success: bool,
        duration_seconds: f64,
    ) -> Self {
        let mut result = Self::new(task_id, if success { 0 } else { 1 });
        result.subtask_order = subtask_order;
        result.aggregate = Some(counters);
        result.success = success;
        result.duration_seconds = duration_seconds;
        result
    }

    /// Human-oriented status word used in logs and the JSON report.
    pub fn status_label(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.signaled {
            "signaled"
        } else if self.success {
            "success"
        } else {
            "failure"
        }
    }
}

/// The workflow's map of completed results plus the execution path.
///
/// Writes go to distinct keys; a key is rewritten only by loop iterations
/// and retries of the same task.
#[derive(Debug, Default, Clone)]
pub struct TaskResults {
    map: HashMap<u32, TaskResult>,
    path: Vec<u32>,
}

impl TaskResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed execution and append it to the execution path.
    pub fn record(&mut self, result: TaskResult) {
        self.path.push(result.task_id);
        self.map.insert(result.task_id, result);
    }

    /// Record a subtask result without touching the top-level execution
    /// path (the aggregate task is the path entry).
    pub fn record_subtask(&mut self, result: TaskResult) {
        self.map.insert(result.task_id, result);
    }

    pub fn get(&self, task_id: u32) -> Option<&TaskResult> {
        self.map.get(&task_id)
    }

    pub fn contains(&self, task_id: u32) -> bool {
        self.map.contains_key(&task_id)
    }

    /// Ids in the order the engine completed them; loop iterations repeat.
    pub fn execution_path(&self) -> &[u32] {
        &self.path
    }

    /// The most recently completed top-level task, if any.
    pub fn last_completed(&self) -> Option<&TaskResult> {
        self.path.last().and_then(|id| self.map.get(id))
    }

    /// All results sorted by task id, for deterministic reporting.
    pub fn sorted_by_id(&self) -> Vec<&TaskResult> {
        let mut results: Vec<&TaskResult> = self.map.values().collect();
        results.sort_by_key(|r| r.task_id);
        results
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
