//! Per-run log file sink.
//!
//! Every execution writes one timestamped log file under the log
//! directory. Each task emits a single structured line per state change
//! (start, end, retry, skip); a summary block closes the file at workflow
//! end. Masked variable values never reach this sink.
use crate::Result;
use crate::core::engine::{WorkflowObserver, WorkflowOutcome};
use crate::core::results::{TaskResult, TaskResults};
use crate::core::task::Task;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Environment override for the log directory.
pub const ENV_LOG_DIR: &str = "TASKER_LOG_DIR";

/// Resolve the log directory: `TASKER_LOG_DIR`, the platform data dir,
/// or a relative fallback for constrained environments.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_LOG_DIR) {
        return PathBuf::from(dir);
    }
    match dirs::data_local_dir() {
        Some(base) => base.join("tasker").join("logs"),
        None => PathBuf::from("tasker-logs"),
    }
}

/// A single run's log file.
pub struct RunLogger {
    file: Mutex<std::fs::File>,
    path: PathBuf,
}

impl RunLogger {
    /// Create `<log-dir>/<taskfile-stem>_<timestamp>.log`.
    pub fn create(log_dir: &Path, task_file: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let stem = task_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("{}_{}.log", stem, timestamp));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One structured line. Sink failures must never fail the workflow,
    /// so they degrade to a warning on the process logger.
    pub fn line(&self, status: &str, detail: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{} {} {}", stamp, status, detail) {
            log::warn!("log sink write failed: {}", e);
        }
    }

    pub fn workflow_start(&self, task_file: &Path, task_count: usize) {
        self.line(
            "WORKFLOW",
            &format!("file={} tasks={}", task_file.display(), task_count),
        );
    }

    /// Closing summary block: one line per executed task, then the
    /// terminal verdict.
    pub fn workflow_end(&self, outcome: &WorkflowOutcome, results: &TaskResults) {
        self.line("SUMMARY", "per-task outcomes follow");
        for result in results.sorted_by_id() {
            self.line(
                "TASK",
                &format!(
                    "task={} status={} exit={} attempts={} duration={:.3}s",
                    result.task_id,
                    result.status_label(),
                    result.exit_code,
                    result.attempts,
                    result.duration_seconds
                ),
            );
        }
        let verdict = if outcome.success { "SUCCESS" } else { "FAILURE" };
        match &outcome.error {
            Some(error) => self.line(
                verdict,
                &format!("exit={} error={}", outcome.exit_code, error),
            ),
            None => self.line(verdict, &format!("exit={}", outcome.exit_code)),
        }
    }
}

impl WorkflowObserver for RunLogger {
    fn on_task_start(&self, task: &Task) {
        let command = task.command.as_deref().unwrap_or("-");
        self.line(
            "START",
            &format!("task={} kind={} command={}", task.id, task.kind, command),
        );
    }

    fn on_task_complete(&self, task: &Task, result: &TaskResult) {
        self.line(
            "END",
            &format!(
                "task={} status={} exit={} duration={:.3}s",
                task.id,
                result.status_label(),
                result.exit_code,
                result.duration_seconds
            ),
        );
    }

    fn on_task_skipped(&self, task: &Task) {
        self.line("SKIP", &format!("task={} condition=false", task.id));
    }

    fn on_retry(&self, task: &Task, attempt: u32) {
        self.line("RETRY", &format!("task={} attempt={}", task.id, attempt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_created_and_written() {
        let dir = TempDir::new().unwrap();
        let logger = RunLogger::create(dir.path(), Path::new("deploy.txt")).unwrap();
        assert!(logger.path().exists());
        assert!(
            logger
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("deploy_")
        );

        let task = Task::new(3, 1);
        logger.on_task_start(&task);
        logger.on_task_skipped(&task);
        let contents = std::fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("START task=3"));
        assert!(contents.contains("SKIP task=3"));
    }

    #[test]
    fn test_summary_block() {
        let dir = TempDir::new().unwrap();
        let logger = RunLogger::create(dir.path(), Path::new("flow.txt")).unwrap();
        let mut results = TaskResults::new();
        let mut result = TaskResult::new(0, 0);
        result.success = true;
        results.record(result);
        let outcome = WorkflowOutcome {
            exit_code: 0,
            success: true,
            final_task_id: Some(0),
            error: None,
        };
        logger.workflow_end(&outcome, &results);
        let contents = std::fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("SUMMARY"));
        assert!(contents.contains("task=0 status=success"));
        assert!(contents.contains("SUCCESS exit=0"));
    }
}
