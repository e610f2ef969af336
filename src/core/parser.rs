//! Task-file parser.
//!
//! Splits a task file into its three leading regions (file-defined CLI
//! arguments, global variable assignments, tasks) and produces typed
//! [`Task`] records plus a diagnostics report. The parser is strict about
//! line shapes but leaves cross-task rules (target existence, required
//! fields per kind, security) to the validation layers.
use crate::Result;
use crate::core::task::{
    GlobalVariables, PERMITTED_GLOBAL_EXCEPTIONS, RESERVED_TASK_KEYS, Task, TaskKind,
};
use crate::core::validator::{Diagnostic, DiagnosticReport};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static GLOBAL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z_][A-Z0-9_]*)=(.*)$").expect("global line regex"));
static TASK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^task=(\d+)$").expect("task header regex"));
static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)=(.*)$").expect("key line regex"));
static FILE_ARG_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^--[a-z][a-z0-9-]*(=.*)?$").expect("file arg regex"));
static ENV_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^env_([A-Za-z_][A-Za-z0-9_]*)$").expect("env key regex"));
static INLINE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s#").expect("inline comment regex"));

/// Everything the parser extracts from one task file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    /// CLI defaults from the leading `--flag` region, in file order.
    pub file_args: Vec<String>,
    /// Global `NAME=value` assignments.
    pub globals: GlobalVariables,
    /// Tasks in declaration order.
    pub tasks: Vec<Task>,
    /// Findings collected while parsing (region violations, bad values,
    /// reserved names, unknown keys).
    pub diagnostics: DiagnosticReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    FileArgs,
    Globals,
    Tasks,
}

/// Parse a task file from disk.
///
/// I/O failures are returned as errors; everything wrong with the file's
/// content lands in the returned diagnostics instead.
pub fn parse(path: &Path) -> Result<ParsedFile> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_str(&text))
}

/// Parse task-file text.
pub fn parse_str(text: &str) -> ParsedFile {
    let mut parsed = ParsedFile::default();
    let mut region = Region::FileArgs;
    let mut current: Option<Task> = None;

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim_end_matches('\r');

        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if INLINE_COMMENT.is_match(line) {
            parsed.diagnostics.push(
                Diagnostic::error(
                    "L1::inline_comment",
                    "inline comments are not supported; use full-line comments",
                )
                .with_line(line_no),
            );
            continue;
        }

        if let Some(caps) = TASK_HEADER.captures(line) {
            if let Some(task) = current.take() {
                parsed.tasks.push(task);
            }
            region = Region::Tasks;
            match caps[1].parse::<u32>() {
                Ok(id) => current = Some(Task::new(id, line_no)),
                Err(_) => {
                    parsed.diagnostics.push(
                        Diagnostic::error(
                            "L1::task_id",
                            format!("task id '{}' is out of range", &caps[1]),
                        )
                        .with_line(line_no),
                    );
                }
            }
            continue;
        }
        if line.starts_with("task=") {
            // Header shape exists but the id is not a plain integer.
            parsed.diagnostics.push(
                Diagnostic::error(
                    "L1::task_id",
                    format!("task id must be a non-negative integer: '{}'", line),
                )
                .with_line(line_no),
            );
            region = Region::Tasks;
            current = None;
            continue;
        }

        match region {
            Region::FileArgs => {
                if line.starts_with("--") {
                    if FILE_ARG_LINE.is_match(line) {
                        parsed.file_args.push(line.to_string());
                    } else {
                        parsed.diagnostics.push(
                            Diagnostic::error(
                                "L1::file_arg",
                                format!("malformed file-defined argument '{}'", line),
                            )
                            .with_line(line_no),
                        );
                    }
                } else {
                    region = Region::Globals;
                    parse_global_line(line, line_no, &mut parsed);
                }
            }
            Region::Globals => {
                if line.starts_with("--") {
                    parsed.diagnostics.push(
                        Diagnostic::error(
                            "L1::region",
                            "file-defined arguments must precede global assignments",
                        )
                        .with_line(line_no),
                    );
                } else {
                    parse_global_line(line, line_no, &mut parsed);
                }
            }
            Region::Tasks => match current.as_mut() {
                Some(task) => parse_task_line(task, line, line_no, &mut parsed.diagnostics),
                None => {
                    parsed.diagnostics.push(
                        Diagnostic::error(
                            "L1::region",
                            format!("line outside of any task: '{}'", line),
                        )
                        .with_line(line_no),
                    );
                }
            },
        }
    }

    if let Some(task) = current.take() {
        parsed.tasks.push(task);
    }
    parsed
}

fn parse_global_line(line: &str, line_no: usize, parsed: &mut ParsedFile) {
    let Some(caps) = GLOBAL_LINE.captures(line) else {
        parsed.diagnostics.push(
            Diagnostic::error(
                "L1::global",
                format!(
                    "expected NAME=value with uppercase NAME, got '{}'",
                    line
                ),
            )
            .with_line(line_no),
        );
        return;
    };
    let name = caps[1].to_string();
    let value = caps[2].to_string();

    if is_reserved_global(&name) {
        parsed.diagnostics.push(
            Diagnostic::error(
                "L1::reserved_global",
                format!("global name '{}' shadows a task-field keyword", name),
            )
            .with_line(line_no),
        );
        return;
    }
    if parsed.globals.insert(name.clone(), value).is_some() {
        parsed.diagnostics.push(
            Diagnostic::warning(
                "L1::duplicate_global",
                format!("global '{}' assigned more than once; last value wins", name),
            )
            .with_line(line_no),
        );
    }
}

/// Reserved-name rule for globals: task-field keywords and the bare name
/// `task` are rejected; STDOUT/STDERR/EXIT are explicitly allowed.
fn is_reserved_global(name: &str) -> bool {
    if PERMITTED_GLOBAL_EXCEPTIONS.contains(&name) {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower == "task" || RESERVED_TASK_KEYS.contains(&lower.as_str())
}

fn parse_task_line(
    task: &mut Task,
    line: &str,
    line_no: usize,
    diagnostics: &mut DiagnosticReport,
) {
    let Some(caps) = KEY_LINE.captures(line) else {
        diagnostics.push(
            Diagnostic::error("L1::key_line", format!("expected key=value, got '{}'", line))
                .with_task(task.id)
                .with_line(line_no),
        );
        return;
    };
    let key = &caps[1];
    let value = caps[2].to_string();

    let mut fail = |rule: &str, message: String| {
        diagnostics.push(
            Diagnostic::error(rule, message)
                .with_task(task.id)
                .with_line(line_no),
        );
    };

    match key {
        "type" => match value.parse::<TaskKind>() {
            Ok(kind) => task.kind = kind,
            Err(e) => fail("L1::type", e),
        },
        "hostname" => task.hostname = Some(value),
        "command" => task.command = Some(value),
        "arguments" => task.arguments = Some(value),
        "exec" => match value.parse() {
            Ok(mode) => task.exec_mode = mode,
            Err(e) => fail("L1::exec", e),
        },
        "timeout" => match value.parse::<u64>() {
            Ok(secs) if secs > 0 => task.timeout_seconds = Some(secs),
            _ => fail(
                "L1::timeout",
                format!("timeout must be a positive integer, got '{}'", value),
            ),
        },
        "sleep" => match value.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => task.sleep_seconds = Some(secs),
            _ => fail(
                "L1::sleep",
                format!("sleep must be a non-negative decimal, got '{}'", value),
            ),
        },
        "loop" => match value.parse::<u32>() {
            Ok(count) if count > 0 => task.loop_count = Some(count),
            _ => fail(
                "L1::loop",
                format!("loop must be a positive integer, got '{}'", value),
            ),
        },
        "loop_break" => match parse_bool(&value) {
            Some(flag) => task.loop_break = flag,
            None => fail(
                "L1::loop_break",
                format!("loop_break must be true or false, got '{}'", value),
            ),
        },
        "condition" => task.condition = Some(value),
        "success" => task.success = Some(value),
        "next" => match value.parse() {
            Ok(rule) => task.next = Some(rule),
            Err(e) => fail("L1::next", e),
        },
        "on_success" => match value.parse::<u32>() {
            Ok(id) => task.on_success = Some(id),
            Err(_) => fail(
                "L1::on_success",
                format!("on_success must be a task id, got '{}'", value),
            ),
        },
        "on_failure" => match value.parse::<u32>() {
            Ok(id) => task.on_failure = Some(id),
            Err(_) => fail(
                "L1::on_failure",
                format!("on_failure must be a task id, got '{}'", value),
            ),
        },
        "tasks" => match parse_id_list(&value) {
            Ok(ids) => task.subtask_ids = ids,
            Err(e) => fail("L1::tasks", e),
        },
        "max_parallel" => match value.parse::<usize>() {
            Ok(n) if n > 0 => task.max_parallel = Some(n),
            _ => fail(
                "L1::max_parallel",
                format!("max_parallel must be a positive integer, got '{}'", value),
            ),
        },
        "if_true_tasks" => match parse_id_list(&value) {
            Ok(ids) => task.if_true_tasks = ids,
            Err(e) => fail("L1::if_true_tasks", e),
        },
        "if_false_tasks" => match parse_id_list(&value) {
            Ok(ids) => task.if_false_tasks = ids,
            Err(e) => fail("L1::if_false_tasks", e),
        },
        "retry_count" => match value.parse::<u32>() {
            Ok(count) => task.retry_count = count,
            Err(_) => fail(
                "L1::retry_count",
                format!("retry_count must be a non-negative integer, got '{}'", value),
            ),
        },
        "retry_delay" => match value.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => task.retry_delay_seconds = secs,
            _ => fail(
                "L1::retry_delay",
                format!("retry_delay must be a non-negative decimal, got '{}'", value),
            ),
        },
        "retry_failed" => match parse_bool(&value) {
            Some(flag) => task.retry_failed = flag,
            None => fail(
                "L1::retry_failed",
                format!("retry_failed must be true or false, got '{}'", value),
            ),
        },
        "stdout_split" => match value.parse() {
            Ok(spec) => task.stdout_split = Some(spec),
            Err(e) => fail("L1::stdout_split", e),
        },
        "stderr_split" => match value.parse() {
            Ok(spec) => task.stderr_split = Some(spec),
            Err(e) => fail("L1::stderr_split", e),
        },
        "return" => match value.parse::<i32>() {
            Ok(code) => task.return_code_override = Some(code),
            Err(_) => fail(
                "L1::return",
                format!("return must be an integer exit code, got '{}'", value),
            ),
        },
        other => {
            if let Some(caps) = ENV_KEY.captures(other) {
                task.env_overrides.push((caps[1].to_string(), value));
            } else if RESERVED_TASK_KEYS.contains(&other.to_ascii_lowercase().as_str()) {
                // A case variant of a real field is almost certainly a typo
                // that would silently change behavior.
                fail(
                    "L1::reserved_key",
                    format!("key '{}' collides with the reserved field '{}'", other,
                        other.to_ascii_lowercase()),
                );
            } else {
                diagnostics.push(
                    Diagnostic::warning(
                        "L1::unknown_key",
                        format!("unknown key '{}' ignored", other),
                    )
                    .with_task(task.id)
                    .with_line(line_no),
                );
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_id_list(value: &str) -> std::result::Result<Vec<u32>, String> {
    let mut ids = Vec::new();
    for part in value.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            return Err(format!("empty id in list '{}'", value));
        }
        let id = trimmed
            .parse::<u32>()
            .map_err(|_| format!("invalid task id '{}' in list", trimmed))?;
        ids.push(id);
    }
    if ids.is_empty() {
        return Err("id list is empty".to_string());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{ExecMode, NextRule};

    #[test]
    fn test_parse_sequential_hello() {
        let parsed = parse_str(
            "task=0\nhostname=localhost\ncommand=echo\narguments=Hello\nexec=local\n",
        );
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(parsed.tasks.len(), 1);
        let task = &parsed.tasks[0];
        assert_eq!(task.id, 0);
        assert_eq!(task.kind, TaskKind::Sequential);
        assert_eq!(task.command.as_deref(), Some("echo"));
        assert_eq!(task.arguments.as_deref(), Some("Hello"));
        assert_eq!(task.exec_mode, ExecMode::Local);
    }

    #[test]
    fn test_parse_regions() {
        let parsed = parse_str(
            "--skip-host-validation\n\
             RETRIES=3\n\
             # comment\n\
             task=1\n\
             command=true\n",
        );
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(parsed.file_args, vec!["--skip-host-validation"]);
        assert_eq!(parsed.globals.get("RETRIES"), Some("3"));
        assert_eq!(parsed.tasks.len(), 1);
    }

    #[test]
    fn test_file_arg_after_global_is_error() {
        let parsed = parse_str("NAME=x\n--validate-only\ntask=0\ncommand=true\n");
        assert!(parsed.diagnostics.has_errors());
        assert!(
            parsed
                .diagnostics
                .iter()
                .any(|d| d.rule == "L1::region")
        );
    }

    #[test]
    fn test_reserved_global_rejected() {
        for name in ["HOSTNAME", "COMMAND", "SUCCESS", "NEXT", "TIMEOUT", "EXEC", "TASK"] {
            let parsed = parse_str(&format!("{}=x\ntask=0\ncommand=true\n", name));
            assert!(
                parsed.diagnostics.has_errors(),
                "expected '{}' to be rejected",
                name
            );
        }
    }

    #[test]
    fn test_permitted_global_exceptions() {
        let parsed = parse_str("STDOUT=keep\nSTDERR=keep\nEXIT=keep\ntask=0\ncommand=true\n");
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(parsed.globals.get("STDOUT"), Some("keep"));
    }

    #[test]
    fn test_inline_comment_rejected() {
        let parsed = parse_str("task=0\ncommand=echo hi # say hi\n");
        assert!(parsed.diagnostics.has_errors());
        assert!(
            parsed
                .diagnostics
                .iter()
                .any(|d| d.rule == "L1::inline_comment")
        );
    }

    #[test]
    fn test_unknown_key_warns_reserved_case_variant_errors() {
        let parsed = parse_str("task=0\ncommand=true\nfrobnicate=1\n");
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(parsed.diagnostics.warning_count(), 1);

        let parsed = parse_str("task=0\ncommand=true\nTimeout=5\n");
        assert!(parsed.diagnostics.has_errors());
        assert!(
            parsed
                .diagnostics
                .iter()
                .any(|d| d.rule == "L1::reserved_key")
        );
    }

    #[test]
    fn test_env_overrides_collected_in_order() {
        let parsed = parse_str("task=0\ncommand=true\nenv_PATH=/usr/bin\nenv_LANG=C\n");
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(
            parsed.tasks[0].env_overrides,
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("LANG".to_string(), "C".to_string())
            ]
        );
    }

    #[test]
    fn test_parallel_task_fields() {
        let parsed = parse_str(
            "task=5\ntype=parallel\ntasks=10,11,12\nmax_parallel=2\nsuccess=min_success=2\n",
        );
        assert!(!parsed.diagnostics.has_errors());
        let task = &parsed.tasks[0];
        assert_eq!(task.kind, TaskKind::Parallel);
        assert_eq!(task.subtask_ids, vec![10, 11, 12]);
        assert_eq!(task.max_parallel, Some(2));
        assert_eq!(task.success.as_deref(), Some("min_success=2"));
    }

    #[test]
    fn test_bad_values_are_errors() {
        let parsed = parse_str(
            "task=0\ncommand=true\ntimeout=0\nsleep=-1\nloop=abc\nmax_parallel=0\nreturn=x\n",
        );
        let rules: Vec<&str> = parsed
            .diagnostics
            .iter()
            .map(|d| d.rule.as_str())
            .collect();
        assert!(rules.contains(&"L1::timeout"));
        assert!(rules.contains(&"L1::sleep"));
        assert!(rules.contains(&"L1::loop"));
        assert!(rules.contains(&"L1::max_parallel"));
        assert!(rules.contains(&"L1::return"));
    }

    #[test]
    fn test_next_keywords() {
        let parsed = parse_str("task=0\ncommand=true\nnext=never\n");
        assert_eq!(parsed.tasks[0].next, Some(NextRule::Never));
        let parsed = parse_str("task=0\ncommand=true\nnext=min_success=2\n");
        assert_eq!(parsed.tasks[0].next, Some(NextRule::MinSuccess(2)));
    }

    #[test]
    fn test_empty_file_has_no_tasks() {
        let parsed = parse_str("# only comments\n\n");
        assert!(parsed.tasks.is_empty());
        assert!(!parsed.diagnostics.has_errors());
    }

    #[test]
    fn test_crlf_line_endings_tolerated() {
        let parsed = parse_str("task=0\r\ncommand=true\r\n");
        assert!(!parsed.diagnostics.has_errors());
        assert_eq!(parsed.tasks.len(), 1);
    }
}
