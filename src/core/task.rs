//! Task definitions for the workflow data model.
//!
//! A task file is parsed into a list of [`Task`] records. Tasks are created
//! by the parser, checked by the validator, and immutable afterwards; the
//! execution engine only reads them.
use std::collections::BTreeMap;
use std::str::FromStr;

/// The kind of a task, selected by the `type` key.
///
/// Sequential is the default when no `type` key is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs a single child process and routes on its success.
    Sequential,
    /// Fans out a list of subtasks through the worker pool.
    Parallel,
    /// Evaluates a condition and dispatches one of two branch lists.
    Conditional,
    /// Pure routing node; evaluates a predicate, spawns nothing.
    Decision,
    /// Terminates the workflow with an explicit exit code.
    Return,
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(TaskKind::Sequential),
            "parallel" => Ok(TaskKind::Parallel),
            "conditional" => Ok(TaskKind::Conditional),
            "decision" => Ok(TaskKind::Decision),
            "return" => Ok(TaskKind::Return),
            other => Err(format!("unrecognized task type '{}'", other)),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskKind::Sequential => "sequential",
            TaskKind::Parallel => "parallel",
            TaskKind::Conditional => "conditional",
            TaskKind::Decision => "decision",
            TaskKind::Return => "return",
        };
        write!(f, "{}", name)
    }
}

/// Execution backend for tasks that spawn a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// argv form, no shell, strict sanitization.
    #[default]
    Local,
    /// Single invocation of a POSIX shell; relaxed security profile.
    Shell,
    /// Remote execution through the `pbrun` wrapper.
    Pbrun,
    /// Remote execution through the `p7s` wrapper.
    P7s,
    /// Remote execution through the `wwrs` wrapper.
    Wwrs,
}

impl ExecMode {
    /// Wrapper program name for remote modes, `None` for local/shell.
    pub fn wrapper_program(&self) -> Option<&'static str> {
        match self {
            ExecMode::Pbrun => Some("pbrun"),
            ExecMode::P7s => Some("p7s"),
            ExecMode::Wwrs => Some("wwrs"),
            ExecMode::Local | ExecMode::Shell => None,
        }
    }

    /// Whether the strict security profile applies to this mode.
    ///
    /// Only `shell` mode gets the relaxed profile; every other mode passes
    /// its fields to an argv array and must not contain shell syntax.
    pub fn strict_profile(&self) -> bool {
        !matches!(self, ExecMode::Shell)
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ExecMode::Local),
            "shell" => Ok(ExecMode::Shell),
            "pbrun" => Ok(ExecMode::Pbrun),
            "p7s" => Ok(ExecMode::P7s),
            "wwrs" => Ok(ExecMode::Wwrs),
            other => Err(format!("unrecognized exec mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecMode::Local => "local",
            ExecMode::Shell => "shell",
            ExecMode::Pbrun => "pbrun",
            ExecMode::P7s => "p7s",
            ExecMode::Wwrs => "wwrs",
        };
        write!(f, "{}", name)
    }
}

/// The `next` routing keyword of a task.
///
/// Applied after success evaluation when no explicit `on_success` /
/// `on_failure` target fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRule {
    /// Advance to the next declared id on success (also the implicit
    /// default and the meaning of `next=success`).
    Success,
    /// Terminate the workflow successfully (exit code 5).
    Never,
    /// Continue to the next declared id regardless of success.
    Always,
    /// Re-execute the current task; bounded by `loop` count.
    Loop,
    /// Advance when every subtask of the most recent aggregate succeeded.
    AllSuccess,
    /// Advance when at least one subtask of the most recent aggregate
    /// succeeded.
    AnySuccess,
    /// Advance when a majority of the most recent aggregate succeeded.
    MajoritySuccess,
    /// Advance when at least K subtasks of the most recent aggregate
    /// succeeded.
    MinSuccess(u32),
}

impl FromStr for NextRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(value) = s.strip_prefix("min_success=") {
            let k: u32 = value
                .parse()
                .map_err(|_| format!("invalid min_success count '{}'", value))?;
            return Ok(NextRule::MinSuccess(k));
        }
        match s {
            "success" => Ok(NextRule::Success),
            "never" => Ok(NextRule::Never),
            "always" => Ok(NextRule::Always),
            "loop" => Ok(NextRule::Loop),
            "all_success" => Ok(NextRule::AllSuccess),
            "any_success" => Ok(NextRule::AnySuccess),
            "majority_success" => Ok(NextRule::MajoritySuccess),
            other => Err(format!("unrecognized next keyword '{}'", other)),
        }
    }
}

/// Delimiter keyword of a `stdout_split` / `stderr_split` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDelimiter {
    Newline,
    Space,
    Tab,
    Comma,
    Semicolon,
    Colon,
    Pipe,
}

impl SplitDelimiter {
    /// The literal separator this keyword stands for.
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitDelimiter::Newline => "\n",
            SplitDelimiter::Space => " ",
            SplitDelimiter::Tab => "\t",
            SplitDelimiter::Comma => ",",
            SplitDelimiter::Semicolon => ";",
            SplitDelimiter::Colon => ":",
            SplitDelimiter::Pipe => "|",
        }
    }
}

impl FromStr for SplitDelimiter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newline" => Ok(SplitDelimiter::Newline),
            "space" => Ok(SplitDelimiter::Space),
            "tab" => Ok(SplitDelimiter::Tab),
            "comma" => Ok(SplitDelimiter::Comma),
            "semicolon" => Ok(SplitDelimiter::Semicolon),
            "colon" => Ok(SplitDelimiter::Colon),
            "pipe" => Ok(SplitDelimiter::Pipe),
            other => Err(format!("unrecognized split delimiter '{}'", other)),
        }
    }
}

/// A `stdout_split` / `stderr_split` specification: delimiter keyword plus
/// zero-based field index, written as `delimiter index` (e.g. `space 2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSpec {
    pub delimiter: SplitDelimiter,
    pub index: usize,
}

impl FromStr for SplitSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let delim = parts
            .next()
            .ok_or_else(|| "split spec requires a delimiter keyword".to_string())?;
        let index = parts
            .next()
            .ok_or_else(|| "split spec requires a zero-based index".to_string())?;
        if parts.next().is_some() {
            return Err(format!("split spec '{}' has trailing input", s));
        }
        Ok(SplitSpec {
            delimiter: delim.parse()?,
            index: index
                .parse()
                .map_err(|_| format!("invalid split index '{}'", index))?,
        })
    }
}

/// A single task record parsed from the file.
///
/// Fields not present in the file keep their defaults. Which fields are
/// required for which kind is enforced by the validator, not here.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique non-negative id; sparse numbering is allowed.
    pub id: u32,
    /// Task kind; sequential when the `type` key is absent.
    pub kind: TaskKind,
    /// Target host for the child process.
    pub hostname: Option<String>,
    /// Program (or shell command line) to run.
    pub command: Option<String>,
    /// Arguments string, whitespace-split for argv modes.
    pub arguments: Option<String>,
    /// Execution backend.
    pub exec_mode: ExecMode,
    /// Per-task timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Suspension after the task completes, before the cursor advances.
    pub sleep_seconds: Option<f64>,
    /// Maximum iterations for `next=loop`.
    pub loop_count: Option<u32>,
    /// Exit the loop early once the success criterion holds.
    pub loop_break: bool,
    /// Skip-guard expression; when false the task is skipped entirely.
    pub condition: Option<String>,
    /// Success criterion; `exit_0` when absent.
    pub success: Option<String>,
    /// Routing keyword applied when no explicit target fires.
    pub next: Option<NextRule>,
    /// Explicit jump target on success.
    pub on_success: Option<u32>,
    /// Explicit jump target on failure.
    pub on_failure: Option<u32>,
    /// Ordered subtask ids of a parallel task (`tasks` key).
    pub subtask_ids: Vec<u32>,
    /// Concurrency ceiling requested for a parallel task.
    pub max_parallel: Option<usize>,
    /// Branch executed when a conditional's condition is true.
    pub if_true_tasks: Vec<u32>,
    /// Branch executed when a conditional's condition is false.
    pub if_false_tasks: Vec<u32>,
    /// Retry attempts for failed executions.
    pub retry_count: u32,
    /// Delay between retry attempts.
    pub retry_delay_seconds: f64,
    /// Reschedule failed parallel subtasks.
    pub retry_failed: bool,
    /// Split spec backing `@N_stdout_line_k@` accessors.
    pub stdout_split: Option<SplitSpec>,
    /// Split spec backing `@N_stderr_line_k@` accessors.
    pub stderr_split: Option<SplitSpec>,
    /// Workflow exit code for `type=return` tasks (`return` key).
    pub return_code_override: Option<i32>,
    /// Environment overrides from `env_<NAME>` keys, in file order.
    pub env_overrides: Vec<(String, String)>,
    /// 1-based source line of the `task=` header, for diagnostics.
    pub source_line: usize,
}

impl Task {
    /// Create an empty task shell for the parser to fill in.
    pub fn new(id: u32, source_line: usize) -> Self {
        Self {
            id,
            kind: TaskKind::Sequential,
            hostname: None,
            command: None,
            arguments: None,
            exec_mode: ExecMode::default(),
            timeout_seconds: None,
            sleep_seconds: None,
            loop_count: None,
            loop_break: false,
            condition: None,
            success: None,
            next: None,
            on_success: None,
            on_failure: None,
            subtask_ids: Vec::new(),
            max_parallel: None,
            if_true_tasks: Vec::new(),
            if_false_tasks: Vec::new(),
            retry_count: 0,
            retry_delay_seconds: 0.0,
            retry_failed: false,
            stdout_split: None,
            stderr_split: None,
            return_code_override: None,
            env_overrides: Vec::new(),
            source_line,
        }
    }

    /// Whether this kind launches a child process of its own.
    pub fn spawns_child(&self) -> bool {
        matches!(self.kind, TaskKind::Sequential)
    }

    /// All task ids this task routes or dispatches to.
    pub fn referenced_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        ids.extend(self.on_success);
        ids.extend(self.on_failure);
        ids.extend(&self.subtask_ids);
        ids.extend(&self.if_true_tasks);
        ids.extend(&self.if_false_tasks);
        ids
    }

    /// The subtask ids owned by this task (parallel or conditional).
    pub fn owned_subtasks(&self) -> Vec<u32> {
        match self.kind {
            TaskKind::Parallel => self.subtask_ids.clone(),
            TaskKind::Conditional => {
                let mut ids = self.if_true_tasks.clone();
                ids.extend(&self.if_false_tasks);
                ids
            }
            _ => Vec::new(),
        }
    }
}

/// Global variables parsed from `NAME=value` lines before the first task.
///
/// Immutable during execution; iteration order is the sorted name order so
/// logs and JSON output are deterministic.
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    values: BTreeMap<String, String>,
}

impl GlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a global; returns the previous value when the name repeats.
    pub fn insert(&mut self, name: String, value: String) -> Option<String> {
        self.values.insert(name, value)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Task-field keywords. A global variable must not shadow any of these;
/// the parser rejects such names outright.
pub const RESERVED_TASK_KEYS: &[&str] = &[
    "type",
    "hostname",
    "command",
    "arguments",
    "exec",
    "timeout",
    "sleep",
    "loop",
    "loop_break",
    "condition",
    "success",
    "next",
    "on_success",
    "on_failure",
    "tasks",
    "max_parallel",
    "if_true_tasks",
    "if_false_tasks",
    "retry_count",
    "retry_delay",
    "retry_failed",
    "stdout_split",
    "stderr_split",
    "return",
];

/// Global names that stay legal despite looking reserved: output references
/// are always written `@N_stdout@`, never `@stdout@`, so these cannot
/// collide.
pub const PERMITTED_GLOBAL_EXCEPTIONS: &[&str] = &["STDOUT", "STDERR", "EXIT"];
