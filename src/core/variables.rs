//! Variable engine: `@name@` token expansion.
//!
//! Resolves tokens against global variables, per-task result fields, and
//! the process environment, in that order. Expansion is applied lazily at
//! the site that needs the string (hostname, command, arguments, condition,
//! success) and never into a stored task definition.
//!
//! Expansion is bounded: a token that expands to another token consumes one
//! depth level, ten levels at most, so reference cycles fail with a
//! deterministic error instead of spinning. Outputs substituted inline are
//! capped at the command-line budget and truncated with a trailing marker
//! when they exceed it.
use crate::Result;
use crate::core::output::{
    CaptureSettings, CleanupRegistry, INLINE_READ_BUDGET, OutputHandle, StreamKind,
    TRUNCATION_MARKER,
};
use crate::core::results::TaskResults;
use crate::core::task::Task;
use crate::error::TaskerError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Maximum chained-expansion depth.
pub const MAX_EXPANSION_DEPTH: usize = 10;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9_]+)@").expect("token regex"));
static TASK_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d+)_(stdout_file|stderr_file|stdout_line_\d+|stderr_line_\d+|stdout|stderr|exit|success|all_success|any_success|majority_success|min_success|max_failed|succeeded_count|failed_count|total)$",
    )
    .expect("task token regex")
});

const MASKED_PREFIXES: &[&str] = &["SECRET_", "MASK_", "HIDE_", "PASSWORD_", "TOKEN_"];
const MASKED_SUFFIXES: &[&str] = &["_PASSWORD", "_TOKEN", "_SECRET", "_KEY"];

/// Whether a variable's value must be masked in logs and diagnostics.
///
/// The substituted value delivered to a child is never masked.
pub fn is_masked_name(name: &str) -> bool {
    MASKED_PREFIXES.iter().any(|p| name.starts_with(p))
        || MASKED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Render a variable for logs: `***` when masked, the value otherwise.
pub fn display_value<'v>(name: &str, value: &'v str) -> &'v str {
    if is_masked_name(name) { "***" } else { value }
}

/// A token reference found by [`scan_tokens`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRef {
    /// `@N_field@` — a task-result field reference.
    TaskField { task_id: u32, field: String },
    /// `@NAME@` — a global or environment variable reference.
    Name(String),
}

/// List every `@token@` in a string without resolving anything.
///
/// The validator uses this to check reference direction and global
/// resolvability before execution.
pub fn scan_tokens(text: &str) -> Vec<TokenRef> {
    TOKEN
        .captures_iter(text)
        .map(|caps| {
            let name = &caps[1];
            match TASK_TOKEN.captures(name) {
                Some(task_caps) => TokenRef::TaskField {
                    task_id: task_caps[1].parse().unwrap_or(u32::MAX),
                    field: task_caps[2].to_string(),
                },
                None => TokenRef::Name(name.to_string()),
            }
        })
        .collect()
}

/// Replace tokens naming known globals with their values, leaving task
/// tokens and unknown names untouched. One pass, no depth accounting:
/// this is the compile-time-known prefix of the full expansion, used by
/// the security layer and expression pre-checks.
pub fn expand_known_globals(text: &str, globals: &crate::core::task::GlobalVariables) -> String {
    TOKEN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match globals.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Where an expanded string is about to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandSite {
    /// Hostname field of a child spawn.
    Hostname,
    /// Command field of a child spawn.
    Command,
    /// Arguments field of a child spawn.
    Arguments,
    /// Value of an `env_<NAME>` override.
    EnvValue,
    /// A condition or success expression.
    Expression,
}

impl ExpandSite {
    /// Sites whose result flows onto a command line and is therefore
    /// subject to the absolute command-line budget.
    fn command_line(&self) -> bool {
        !matches!(self, ExpandSite::Expression)
    }
}

/// The outcome of one expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expanded {
    pub value: String,
    /// Some referenced output was cut at the inline budget.
    pub truncated: bool,
}

/// The absolute command-line substitution budget: the lesser of the
/// platform ARG_MAX and 100 KB.
pub fn command_line_budget() -> usize {
    let cap = INLINE_READ_BUDGET;
    #[cfg(unix)]
    {
        let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
        if arg_max > 0 {
            return cap.min(arg_max as usize);
        }
    }
    cap
}

/// Read-only view over everything tokens can resolve against.
pub struct VariableEngine<'a> {
    tasks: &'a BTreeMap<u32, Task>,
    globals: &'a crate::core::task::GlobalVariables,
    results: &'a TaskResults,
    registry: &'a CleanupRegistry,
    settings: &'a CaptureSettings,
}

impl<'a> VariableEngine<'a> {
    pub fn new(
        tasks: &'a BTreeMap<u32, Task>,
        globals: &'a crate::core::task::GlobalVariables,
        results: &'a TaskResults,
        registry: &'a CleanupRegistry,
        settings: &'a CaptureSettings,
    ) -> Self {
        Self {
            tasks,
            globals,
            results,
            registry,
            settings,
        }
    }

    /// Expand every token in `input` for the given site.
    ///
    /// Unknown tokens fail with a task-dependency error before any child
    /// is spawned. Oversized outputs at command-line sites are truncated
    /// with a trailing marker instead of failing.
    pub fn expand(&self, input: &str, site: ExpandSite) -> Result<Expanded> {
        let mut value = input.to_string();
        let mut truncated = false;

        for _depth in 0..MAX_EXPANSION_DEPTH {
            if !TOKEN.is_match(&value) {
                break;
            }
            let mut replaced_any = false;
            let mut failure: Option<TaskerError> = None;
            let next = TOKEN
                .replace_all(&value, |caps: &regex::Captures<'_>| {
                    if failure.is_some() {
                        return caps[0].to_string();
                    }
                    match self.resolve(&caps[1]) {
                        Ok((text, was_truncated)) => {
                            replaced_any = true;
                            truncated |= was_truncated;
                            text
                        }
                        Err(e) => {
                            failure = Some(e);
                            caps[0].to_string()
                        }
                    }
                })
                .into_owned();
            if let Some(e) = failure {
                return Err(e);
            }
            if !replaced_any {
                break;
            }
            value = next;
        }

        if TOKEN.is_match(&value) {
            return Err(TaskerError::expression(format!(
                "variable expansion exceeded depth {} (reference cycle?) in '{}'",
                MAX_EXPANSION_DEPTH, input
            )));
        }

        if site.command_line() {
            let budget = command_line_budget();
            if value.len() > budget {
                let mut cut = budget.saturating_sub(TRUNCATION_MARKER.len());
                while cut > 0 && !value.is_char_boundary(cut) {
                    cut -= 1;
                }
                value.truncate(cut);
                value.push_str(TRUNCATION_MARKER);
                truncated = true;
            }
        }

        Ok(Expanded { value, truncated })
    }

    fn resolve(&self, name: &str) -> Result<(String, bool)> {
        if let Some(caps) = TASK_TOKEN.captures(name) {
            let task_id: u32 = caps[1]
                .parse()
                .map_err(|_| TaskerError::task_dependency(format!("@{}@", name)))?;
            let field = &caps[2];
            return self.resolve_task_field(task_id, field, name);
        }
        if let Some(value) = self.globals.get(name) {
            return Ok((value.to_string(), false));
        }
        if let Ok(value) = std::env::var(name) {
            return Ok((value, false));
        }
        Err(TaskerError::task_dependency(format!("@{}@", name)))
    }

    fn resolve_task_field(&self, task_id: u32, field: &str, token: &str) -> Result<(String, bool)> {
        let result = self
            .results
            .get(task_id)
            .ok_or_else(|| TaskerError::task_dependency(format!("@{}@", token)))?;

        let unresolved = || TaskerError::task_dependency(format!("@{}@", token));

        if let Some(index) = field.strip_prefix("stdout_line_") {
            let index: usize = index.parse().map_err(|_| unresolved())?;
            return self.split_field(task_id, StreamKind::Stdout, index, token);
        }
        if let Some(index) = field.strip_prefix("stderr_line_") {
            let index: usize = index.parse().map_err(|_| unresolved())?;
            return self.split_field(task_id, StreamKind::Stderr, index, token);
        }

        let value = match field {
            "stdout" => {
                let (text, truncated) = result.stdout.text_for_substitution()?;
                return Ok((text, truncated));
            }
            "stderr" => {
                let (text, truncated) = result.stderr.text_for_substitution()?;
                return Ok((text, truncated));
            }
            "stdout_file" => {
                return Ok((
                    self.materialized_path(&result.stdout, StreamKind::Stdout)?,
                    false,
                ));
            }
            "stderr_file" => {
                return Ok((
                    self.materialized_path(&result.stderr, StreamKind::Stderr)?,
                    false,
                ));
            }
            "exit" => result.exit_code.to_string(),
            "success" => result.success.to_string(),
            "all_success" => {
                let agg = result.aggregate.ok_or_else(unresolved)?;
                (agg.failed == 0 && agg.timed_out == 0 && agg.total > 0).to_string()
            }
            "any_success" => {
                let agg = result.aggregate.ok_or_else(unresolved)?;
                (agg.succeeded > 0).to_string()
            }
            "majority_success" => {
                let agg = result.aggregate.ok_or_else(unresolved)?;
                (agg.percent_succeeded() >= crate::core::evaluator::DEFAULT_MAJORITY_PERCENT)
                    .to_string()
            }
            // The quantities the min_success / max_failed criteria compare
            // against their K.
            "min_success" | "succeeded_count" => {
                result.aggregate.ok_or_else(unresolved)?.succeeded.to_string()
            }
            "max_failed" | "failed_count" => {
                result.aggregate.ok_or_else(unresolved)?.failed.to_string()
            }
            "total" => result.aggregate.ok_or_else(unresolved)?.total.to_string(),
            _ => return Err(unresolved()),
        };
        Ok((value, false))
    }

    fn split_field(
        &self,
        task_id: u32,
        stream: StreamKind,
        index: usize,
        token: &str,
    ) -> Result<(String, bool)> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| TaskerError::task_dependency(format!("@{}@", token)))?;
        let spec = match stream {
            StreamKind::Stdout => task.stdout_split,
            StreamKind::Stderr => task.stderr_split,
        }
        .ok_or_else(|| {
            TaskerError::expression(format!(
                "@{}@ requires a {} spec on task {}",
                token,
                match stream {
                    StreamKind::Stdout => "stdout_split",
                    StreamKind::Stderr => "stderr_split",
                },
                task_id
            ))
        })?;

        let result = self
            .results
            .get(task_id)
            .ok_or_else(|| TaskerError::task_dependency(format!("@{}@", token)))?;
        let handle = match stream {
            StreamKind::Stdout => &result.stdout,
            StreamKind::Stderr => &result.stderr,
        };
        // Line k of the stream, then the split spec picks the field
        // within that line.
        let (text, truncated) = handle.text_for_substitution()?;
        let line = text.lines().nth(index).unwrap_or("");
        let field = line
            .split(spec.delimiter.as_str())
            .nth(spec.index)
            .unwrap_or("")
            .to_string();
        Ok((field, truncated))
    }

    /// Path for a `@N_stdout_file@` reference. On-disk captures hand out
    /// their temp file directly; in-memory captures are written out once
    /// so the child receives a real path, tracked for workflow cleanup.
    fn materialized_path(&self, handle: &OutputHandle, kind: StreamKind) -> Result<String> {
        if let Some(path) = handle.path() {
            return Ok(path.display().to_string());
        }
        let (bytes, _) = handle.read_all(usize::MAX)?;
        let seq = std::time::UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = format!(
            "{}{}_{}_inline",
            kind.temp_prefix(),
            std::process::id(),
            seq
        );
        let path = self.settings.temp_dir.join(name);
        std::fs::write(&path, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        self.registry.register(path.clone());
        Ok(path.display().to_string())
    }
}
