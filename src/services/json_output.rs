//! Machine-readable run report (`--output-json`).
//!
//! The report mirrors what the log file records: workflow metadata, the
//! execution summary, per-task results, and the global variables.
//! Variables with masked names are rendered as `***`, never their values.
use crate::Result;
use crate::core::engine::WorkflowOutcome;
use crate::core::output::INLINE_READ_BUDGET;
use crate::core::results::{TaskResult, TaskResults};
use crate::core::task::GlobalVariables;
use crate::core::variables::display_value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct WorkflowReport {
    pub workflow_metadata: WorkflowMetadata,
    pub execution_summary: ExecutionSummary,
    pub task_results: Vec<TaskReport>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowMetadata {
    pub task_file: String,
    pub project: Option<String>,
    pub tasker_version: String,
    pub generated_at: String,
}

#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub exit_code: i32,
    pub success: bool,
    pub final_task_id: Option<u32>,
    pub execution_path: Vec<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub task_id: u32,
    pub status: String,
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub attempts: u32,
    pub duration_seconds: f64,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateReport>,
}

#[derive(Debug, Serialize)]
pub struct AggregateReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub ratio_succeeded: f64,
    pub subtasks: Vec<u32>,
}

/// Assemble the report from a finished workflow.
pub fn build_report(
    task_file: &Path,
    project: Option<&str>,
    outcome: &WorkflowOutcome,
    results: &TaskResults,
    globals: &GlobalVariables,
) -> WorkflowReport {
    let variables = globals
        .iter()
        .map(|(name, value)| (name.to_string(), display_value(name, value).to_string()))
        .collect();

    WorkflowReport {
        workflow_metadata: WorkflowMetadata {
            task_file: task_file.display().to_string(),
            project: project.map(str::to_string),
            tasker_version: crate::VERSION.to_string(),
            generated_at: chrono::Local::now().to_rfc3339(),
        },
        execution_summary: ExecutionSummary {
            exit_code: outcome.exit_code,
            success: outcome.success,
            final_task_id: outcome.final_task_id,
            execution_path: results.execution_path().to_vec(),
            error: outcome.error.clone(),
        },
        task_results: results.sorted_by_id().into_iter().map(task_report).collect(),
        variables,
    }
}

fn task_report(result: &TaskResult) -> TaskReport {
    let read = |handle: &crate::core::output::OutputHandle| {
        handle
            .read_all(INLINE_READ_BUDGET)
            .map(|(bytes, truncated)| (String::from_utf8_lossy(&bytes).into_owned(), truncated))
            .unwrap_or_else(|_| (String::new(), false))
    };
    let (stdout, stdout_truncated) = read(&result.stdout);
    let (stderr, stderr_truncated) = read(&result.stderr);

    TaskReport {
        task_id: result.task_id,
        status: result.status_label().to_string(),
        exit_code: result.exit_code,
        success: result.success,
        timed_out: result.timed_out,
        attempts: result.attempts,
        duration_seconds: result.duration_seconds,
        stdout,
        stderr,
        output_truncated: stdout_truncated || stderr_truncated || result.substitution_truncated,
        aggregate: result.aggregate.map(|agg| AggregateReport {
            total: agg.total,
            succeeded: agg.succeeded,
            failed: agg.failed,
            timed_out: agg.timed_out,
            ratio_succeeded: agg.ratio_succeeded(),
            subtasks: result.subtask_order.clone(),
        }),
    }
}

/// Write the report as pretty JSON, creating parent directories.
pub fn write_report(path: &Path, report: &WorkflowReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

/// Default location when `--output-json` is given without a path:
/// `<log-dir>/output/<taskfile>_<timestamp>.json`.
pub fn default_output_path(log_dir: &Path, task_file: &Path) -> PathBuf {
    let stem = task_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    log_dir
        .join("output")
        .join(format!("{}_{}.json", stem, timestamp))
}
