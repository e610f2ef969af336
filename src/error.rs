//! Error types for the TASKER workflow engine.
//!
//! This module defines the `TaskerError` enum covering all error conditions
//! that can occur during task-file validation, variable resolution, child
//! process execution, and workflow control flow.
//!
//! It also provides helper methods to construct errors and generate
//! user-friendly messages.
use thiserror::Error;

/// Represents all possible errors in the TASKER application.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Exit Codes
///
/// Each error variant maps to a workflow exit code via
/// `TaskerError::exit_code`:
///
/// | code | meaning |
/// |------|---------|
/// | 1    | general failure |
/// | 14   | conditional-aggregate failure |
/// | 20   | validation failure (including host validation) |
/// | 21   | task-dependency failure |
/// | 24   | no tasks parsed from the file |
/// | 124  | workflow timeout |
/// | 130  | interrupted (SIGINT) |
/// | 143  | terminated (SIGTERM) |
#[derive(Error, Debug)]
pub enum TaskerError {
    /// I/O operation failed during file system access.
    ///
    /// This variant wraps `std::io::Error` and provides context about
    /// file operations that failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task file failed pre-execution validation (layers L1-L3/L5).
    ///
    /// Contains a human-readable summary of the findings. The full
    /// diagnostics report is logged before this error is surfaced.
    #[error("Validation failed: {message}")]
    Validation {
        /// Summary of the validation findings
        message: String,
    },

    /// The task file parsed cleanly but contained no tasks.
    #[error("No tasks found in {path}")]
    NoTasksFound {
        /// The task file that was parsed
        path: String,
    },

    /// A runtime host probe (layer L4) failed.
    #[error("Host validation failed for '{host}': {message}")]
    HostValidation {
        /// The hostname that failed the probe
        host: String,
        /// Description of the probe failure
        message: String,
    },

    /// A variable reference could not be resolved before task dispatch.
    ///
    /// Raised when a `@N_stdout@`-style token refers to a task that has
    /// not produced a result (skipped, not yet executed, or unknown).
    #[error("Unresolved task dependency: {token}")]
    TaskDependency {
        /// The token that failed to resolve
        token: String,
    },

    /// A conditional or parallel aggregate's success criterion was false
    /// and no routing absorbed the failure.
    #[error("Conditional aggregate failed at task {task_id}")]
    ConditionalFailure {
        /// The aggregate task whose criterion evaluated false
        task_id: u32,
    },

    /// The workflow-wide master timeout fired.
    #[error("Workflow timed out after {seconds}s")]
    WorkflowTimeout {
        /// The configured master timeout
        seconds: u64,
    },

    /// The workflow was cancelled by an external signal.
    #[error("Workflow cancelled by {signal}")]
    Cancelled {
        /// The signal that triggered cancellation
        signal: CancelSignal,
    },

    /// A child process could not be spawned.
    #[error("Failed to spawn '{command}': {message}")]
    Spawn {
        /// The command that failed to start
        command: String,
        /// The underlying spawn failure
        message: String,
    },

    /// An expression (condition or success criterion) failed to parse
    /// or evaluate.
    #[error("Expression error: {message}")]
    Expression {
        /// Description of the parse or evaluation failure
        message: String,
    },

    /// An internal invariant was violated.
    ///
    /// These indicate bugs in the engine, never authoring mistakes in the
    /// task file.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The signal that cancelled a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSignal {
    /// SIGINT (Ctrl-C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl std::fmt::Display for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelSignal::Interrupt => write!(f, "SIGINT"),
            CancelSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}


impl From<regex::Error> for TaskerError {
    fn from(err: regex::Error) -> Self {
        TaskerError::Expression {
            message: format!("invalid regex: {}", err),
        }
    }
}

impl From<serde_json::Error> for TaskerError {
    fn from(err: serde_json::Error) -> Self {
        TaskerError::Internal(format!("JSON serialization error: {}", err))
    }
}

/// Specialized `Result` type for TASKER operations.
pub type TaskerResult<T> = Result<T, TaskerError>;

impl TaskerError {
    /// Create a validation error with the given message.
    pub fn validation<S: Into<String>>(message: S) -> Self {
        TaskerError::Validation {
            message: message.into(),
        }
    }

    /// Create a host validation error for the given host.
    pub fn host_validation<S1, S2>(host: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        TaskerError::HostValidation {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a task-dependency error for an unresolved token.
    pub fn task_dependency<S: Into<String>>(token: S) -> Self {
        TaskerError::TaskDependency {
            token: token.into(),
        }
    }

    /// Create an expression parse/evaluation error.
    pub fn expression<S: Into<String>>(message: S) -> Self {
        TaskerError::Expression {
            message: message.into(),
        }
    }

    /// Create a spawn failure for the given command.
    pub fn spawn<S1, S2>(command: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        TaskerError::Spawn {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an internal invariant-violation error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        TaskerError::Internal(message.into())
    }

    /// Return the corresponding workflow exit code for this error variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskerError::Io(_) => 1,
            TaskerError::Validation { .. } => 20,
            TaskerError::HostValidation { .. } => 20,
            TaskerError::TaskDependency { .. } => 21,
            TaskerError::NoTasksFound { .. } => 24,
            TaskerError::ConditionalFailure { .. } => 14,
            TaskerError::WorkflowTimeout { .. } => 124,
            TaskerError::Cancelled { signal } => match signal {
                CancelSignal::Interrupt => 130,
                CancelSignal::Terminate => 143,
            },
            TaskerError::Spawn { .. } => 1,
            TaskerError::Expression { .. } => 20,
            TaskerError::Internal(_) => 1,
            TaskerError::Other(_) => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    pub fn user_friendly_message(&self) -> String {
        match self {
            TaskerError::Io(e) => format!("File operation error: {}", e),
            TaskerError::Validation { message } => format!(
                "Validation failed: {}\nHint: run with --validate-only to see the full report",
                message
            ),
            TaskerError::NoTasksFound { path } => format!(
                "No tasks found in {}\nHint: tasks begin with a 'task=N' line",
                path
            ),
            TaskerError::HostValidation { host, message } => format!(
                "Host validation failed for '{}': {}\nHint: use --skip-host-validation to bypass reachability probes",
                host, message
            ),
            TaskerError::TaskDependency { token } => format!(
                "Unresolved task dependency: {}\nHint: the referenced task must complete on every feasible execution path before it is used",
                token
            ),
            TaskerError::ConditionalFailure { task_id } => format!(
                "Conditional aggregate failed at task {}\nHint: set on_failure to route around aggregate failures",
                task_id
            ),
            TaskerError::Spawn { command, message } => {
                format!("Failed to spawn '{}': {}", command, message)
            }
            TaskerError::Internal(msg) => {
                format!("Internal error: {}\nHint: please report this issue", msg)
            }
            _ => format!("Error: {}", self),
        }
    }
}
