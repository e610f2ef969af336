use std::path::{Path, PathBuf};
use tasker_cli::core::engine::{EngineOptions, ExecutionEngine};
use tasker_cli::core::output::CaptureSettings;
use tasker_cli::core::parser;
use tasker_cli::core::scheduler::PoolPolicy;
use tempfile::TempDir;

/// Workspace for one test: a temp directory holding the task file, the
/// capture temp dir, and the log dir.
#[allow(dead_code)]
pub struct WorkflowFixture {
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl WorkflowFixture {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write a task file into the workspace.
    pub fn write_task_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Build an engine over task-file text, with captures and spillover
    /// files kept inside the workspace.
    pub fn engine(&self, text: &str) -> ExecutionEngine {
        let parsed = parser::parse_str(text);
        assert!(
            !parsed.diagnostics.has_errors(),
            "fixture task file does not parse:\n{}",
            parsed.diagnostics.render()
        );
        let options = EngineOptions {
            capture_settings: CaptureSettings {
                temp_dir: self.path().to_path_buf(),
                ..CaptureSettings::default()
            },
            policy: PoolPolicy::fixed(8, 1, 0),
            start_from: None,
            master_timeout: None,
        };
        ExecutionEngine::new(parsed.tasks, parsed.globals, options)
    }

    /// Leftover capture temp files in the workspace.
    pub fn capture_temp_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with("tasker_"))
                    .unwrap_or(false)
            })
            .collect()
    }
}
