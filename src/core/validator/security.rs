//! L3 security checks.
//!
//! Every string field is audited after expanding compile-time-known
//! globals, so a hostile value cannot hide behind a variable reference.
//! Two profiles exist: the strict profile for every mode whose fields end
//! up in an argv array, and the relaxed profile for `exec=shell`, where
//! metacharacters are the point. The relaxed profile still rejects null
//! bytes, encoded-attack patterns, and oversized fields.
use super::{Diagnostic, DiagnosticReport};
use crate::core::parser::ParsedFile;
use crate::core::task::{Task, TaskKind};
use crate::core::variables::expand_known_globals;
use once_cell::sync::Lazy;
use regex::Regex;

/// Overall arguments length cap.
pub const MAX_ARGUMENTS_LEN: usize = 8192;
/// Arguments length cap under the strict profile.
pub const MAX_ARGUMENTS_LEN_STRICT: usize = 2000;

/// Shell-injection shapes rejected under the strict profile.
const INJECTION_SHAPES: &[(&str, &str)] = &[
    (";", "command separator ';'"),
    ("&&", "command chain '&&'"),
    ("||", "command chain '||'"),
    ("|", "pipe '|'"),
    ("`", "backtick substitution"),
    ("$(", "command substitution '$('"),
    ("\n", "embedded newline"),
];

static PERCENT_ENCODED_META: Lazy<Regex> = Lazy::new(|| {
    // Percent-encoded ; | & $ ` < > plus slash variants used in traversal.
    Regex::new(r"(?i)%(3b|7c|26|24|60|3c|3e|2f|5c)").expect("percent-encoding regex")
});
static HEX_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\x[0-9a-fA-F]{2}").expect("hex escape regex"));
static UNICODE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\u[0-9a-fA-F]{4}").expect("unicode escape regex"));
static FORMAT_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%[sdxnp]").expect("format string regex"));

pub(super) fn check(parsed: &ParsedFile, report: &mut DiagnosticReport) {
    for (name, value) in parsed.globals.iter() {
        if value.contains('\0') {
            report.push(Diagnostic::error(
                "L3::null_byte",
                format!("global '{}' contains a null byte", name),
            ));
        }
    }
    for task in &parsed.tasks {
        check_task(task, parsed, report);
    }
}

fn check_task(task: &Task, parsed: &ParsedFile, report: &mut DiagnosticReport) {
    if !matches!(
        task.kind,
        TaskKind::Sequential | TaskKind::Parallel | TaskKind::Conditional
    ) {
        // Decision and return tasks never reach a child process.
        return;
    }
    let strict = task.exec_mode.strict_profile();

    let mut finding = |rule: &str, message: String| {
        report.push(
            Diagnostic::error(rule, message)
                .with_task(task.id)
                .with_line(task.source_line),
        );
    };

    let fields: Vec<(&str, String)> = [
        ("hostname", task.hostname.as_deref()),
        ("command", task.command.as_deref()),
        ("arguments", task.arguments.as_deref()),
    ]
    .into_iter()
    .filter_map(|(name, value)| {
        value.map(|v| (name, expand_known_globals(v, &parsed.globals)))
    })
    .chain(
        task.env_overrides
            .iter()
            .map(|(_, v)| ("environment override", expand_known_globals(v, &parsed.globals))),
    )
    .collect();

    for (field, value) in &fields {
        if value.contains('\0') {
            finding("L3::null_byte", format!("{} contains a null byte", field));
        }

        if strict {
            for (shape, label) in INJECTION_SHAPES {
                if value.contains(shape) {
                    finding(
                        "L3::injection",
                        format!("{} contains {} (strict profile)", field, label),
                    );
                    break;
                }
            }
        }

        if PERCENT_ENCODED_META.is_match(value) {
            finding(
                "L3::encoded_attack",
                format!("{} contains percent-encoded shell metacharacters", field),
            );
        }
        if HEX_ESCAPE.is_match(value) || UNICODE_ESCAPE.is_match(value) {
            finding(
                "L3::encoded_attack",
                format!("{} contains hex/unicode escape sequences", field),
            );
        }
    }

    // Path traversal. Any field can carry a path payload (a traversal
    // string is most at home in arguments), so every field is checked.
    for (field, value) in &fields {
        if value.contains("../") || value.contains("..\\") {
            finding(
                "L3::path_traversal",
                format!("{} contains a path-traversal shape", field),
            );
        }
    }

    // Format-string attacks matter where the value reaches an interpreter.
    if !strict {
        for (field, value) in &fields {
            if (*field == "command" || *field == "arguments") && FORMAT_STRING.is_match(value) {
                finding(
                    "L3::format_string",
                    format!("{} contains format-string directives", field),
                );
            }
        }
    }

    if let Some(arguments) = &task.arguments {
        let expanded = expand_known_globals(arguments, &parsed.globals);
        if expanded.len() > MAX_ARGUMENTS_LEN {
            finding(
                "L3::length_cap",
                format!(
                    "arguments length {} exceeds the {} byte cap",
                    expanded.len(),
                    MAX_ARGUMENTS_LEN
                ),
            );
        } else if strict && expanded.len() > MAX_ARGUMENTS_LEN_STRICT {
            finding(
                "L3::length_cap",
                format!(
                    "arguments length {} exceeds the strict-profile {} byte cap",
                    expanded.len(),
                    MAX_ARGUMENTS_LEN_STRICT
                ),
            );
        }
    }
}
