//! Recovery state persistence for `--auto-recovery`.
//!
//! While a workflow runs, each completed top-level task is appended to a
//! JSON state file under `<log-dir>/recovery/`. A workflow that dies
//! mid-execution can resume: completed results are re-hydrated so
//! variable references keep resolving, and the cursor restarts after the
//! last completed task. The state file is deleted on terminal success and
//! retained on failure.
use crate::Result;
use crate::core::engine::WorkflowObserver;
use crate::core::output::{INLINE_READ_BUDGET, OutputHandle};
use crate::core::results::TaskResult;
use crate::core::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The recorded outcome of one completed task, trimmed to what later
/// tasks can reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredResult {
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub attempts: u32,
    /// Inline-budget prefix of the captured stdout.
    pub stdout: String,
    pub stderr: String,
}

impl RecoveredResult {
    pub fn from_result(result: &TaskResult) -> Self {
        let read = |handle: &OutputHandle| {
            handle
                .read_all(INLINE_READ_BUDGET)
                .map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default()
        };
        Self {
            exit_code: result.exit_code,
            success: result.success,
            timed_out: result.timed_out,
            attempts: result.attempts,
            stdout: read(&result.stdout),
            stderr: read(&result.stderr),
        }
    }

    /// Rebuild an in-memory result good enough for variable references.
    pub fn hydrate(&self, task_id: u32) -> TaskResult {
        let mut result = TaskResult::new(task_id, self.exit_code);
        result.success = self.success;
        result.timed_out = self.timed_out;
        result.attempts = self.attempts;
        result.stdout = OutputHandle::from_bytes(self.stdout.clone().into_bytes());
        result.stderr = OutputHandle::from_bytes(self.stderr.clone().into_bytes());
        result
    }
}

/// Everything persisted between a crash and a resume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryState {
    pub task_file: String,
    pub completed: BTreeMap<u32, RecoveredResult>,
    pub updated_at: String,
}

impl RecoveryState {
    /// The id to restart from: the task after the last completed one, by
    /// the declared order given.
    pub fn resume_cursor(&self, declared_order: &[u32]) -> Option<u32> {
        let last_position = declared_order
            .iter()
            .rposition(|id| self.completed.contains_key(id))?;
        declared_order.get(last_position + 1).copied()
    }
}

/// Handle to one task file's recovery slot on disk.
pub struct RecoveryStore {
    path: PathBuf,
}

impl RecoveryStore {
    /// `<log-dir>/recovery/<hash>.recovery.json`, keyed by the task
    /// file's absolute path.
    pub fn for_file(log_dir: &Path, task_file: &Path) -> Self {
        let absolute = task_file
            .canonicalize()
            .unwrap_or_else(|_| task_file.to_path_buf());
        let mut hasher = DefaultHasher::new();
        absolute.hash(&mut hasher);
        let path = log_dir
            .join("recovery")
            .join(format!("{:016x}.recovery.json", hasher.finish()));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<RecoveryState>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state: &RecoveryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    /// Remove the state file; already-gone is not an error.
    pub fn delete(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove recovery file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Observer that checkpoints the state file after every completed task.
pub struct RecoveryWriter {
    store: RecoveryStore,
    state: Mutex<RecoveryState>,
}

impl RecoveryWriter {
    pub fn new(store: RecoveryStore, task_file: &Path, initial: Option<RecoveryState>) -> Self {
        let mut state = initial.unwrap_or_default();
        state.task_file = task_file.display().to_string();
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    pub fn store(&self) -> &RecoveryStore {
        &self.store
    }
}

impl WorkflowObserver for RecoveryWriter {
    fn on_task_complete(&self, task: &Task, result: &TaskResult) {
        let mut state = self.state.lock().unwrap();
        state
            .completed
            .insert(task.id, RecoveredResult::from_result(result));
        state.updated_at = chrono::Local::now().to_rfc3339();
        if let Err(e) = self.store.save(&state) {
            log::warn!("recovery checkpoint failed: {}", e);
        }
    }
}
