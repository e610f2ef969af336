//! L2 semantic checks.
//!
//! Works on the whole task list at once: every routing target must exist,
//! each kind must carry its required fields, expressions must parse, and
//! `@N_*@` references must point at tasks that complete earlier on every
//! feasible execution path. Subtask ownership is also audited here: a
//! subtask reachable by sequential fall-through is almost always an
//! authoring mistake, fixed by inserting a firewall task with `return=N`
//! in front of the subtask block.
use super::{Diagnostic, DiagnosticReport};
use crate::core::evaluator;
use crate::core::parser::ParsedFile;
use crate::core::task::{Task, TaskKind};
use crate::core::variables::{TokenRef, expand_known_globals, scan_tokens};
use std::collections::HashMap;

pub(super) fn check(parsed: &ParsedFile, report: &mut DiagnosticReport) {
    let index_of: HashMap<u32, usize> = parsed
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (task.id, index))
        .collect();

    // Subtask id -> owning aggregate id.
    let mut owner_of: HashMap<u32, u32> = HashMap::new();
    for task in &parsed.tasks {
        for subtask in task.owned_subtasks() {
            owner_of.insert(subtask, task.id);
        }
    }

    for task in &parsed.tasks {
        check_targets(task, &index_of, report);
        check_required_fields(task, report);
        check_expressions(task, parsed, report);
        check_reference_direction(task, parsed, &index_of, &owner_of, report);
    }
    check_ownership_gaps(parsed, &owner_of, report);
}

fn check_targets(task: &Task, index_of: &HashMap<u32, usize>, report: &mut DiagnosticReport) {
    for id in task.referenced_ids() {
        if !index_of.contains_key(&id) {
            report.push(
                Diagnostic::error(
                    "L2::missing_target",
                    format!("referenced task {} is not declared", id),
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }
    }
}

fn check_required_fields(task: &Task, report: &mut DiagnosticReport) {
    let mut require = |present: bool, what: &str| {
        if !present {
            report.push(
                Diagnostic::error(
                    "L2::required_field",
                    format!("{} task requires {}", task.kind, what),
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }
    };

    match task.kind {
        TaskKind::Sequential => require(task.command.is_some(), "a command"),
        TaskKind::Parallel => require(!task.subtask_ids.is_empty(), "a tasks list"),
        TaskKind::Conditional => {
            require(task.condition.is_some(), "a condition");
            require(
                !task.if_true_tasks.is_empty() || !task.if_false_tasks.is_empty(),
                "at least one of if_true_tasks / if_false_tasks",
            );
        }
        TaskKind::Decision => require(task.condition.is_some(), "a condition"),
        TaskKind::Return => require(task.return_code_override.is_some(), "a return code"),
    }
}

fn check_expressions(task: &Task, parsed: &ParsedFile, report: &mut DiagnosticReport) {
    for (key, expression) in [("condition", &task.condition), ("success", &task.success)] {
        let Some(expression) = expression else {
            continue;
        };
        // Globals are compile-time-known; task tokens become opaque string
        // operands of comparison atoms, so the shape is checkable now.
        let resolved = expand_known_globals(expression, &parsed.globals);
        if let Err(e) = evaluator::parse_expression(&resolved) {
            report.push(
                Diagnostic::error(
                    "L2::expression",
                    format!("{} does not parse: {}", key, e),
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }
    }

    // Every global-looking token in any string field must resolve, either
    // as a file global or from the environment.
    for field in string_fields(task) {
        for token in scan_tokens(&field) {
            if let TokenRef::Name(name) = token {
                if !parsed.globals.contains(&name) && std::env::var(&name).is_err() {
                    report.push(
                        Diagnostic::error(
                            "L2::unresolved_global",
                            format!("@{}@ names no global variable", name),
                        )
                        .with_task(task.id)
                        .with_line(task.source_line),
                    );
                }
            }
        }
    }
}

/// The forward-dependency rule: a `@k_*@` reference is legal only when
/// task k is guaranteed complete before the referencing task runs. That
/// means k (or the aggregate that owns k) must be declared strictly
/// before the referencing task (or the aggregate that owns it).
fn check_reference_direction(
    task: &Task,
    parsed: &ParsedFile,
    index_of: &HashMap<u32, usize>,
    owner_of: &HashMap<u32, u32>,
    report: &mut DiagnosticReport,
) {
    // Position at which the referencing task starts executing.
    let reader_position = owner_of
        .get(&task.id)
        .and_then(|owner| index_of.get(owner))
        .or_else(|| index_of.get(&task.id))
        .copied()
        .unwrap_or(usize::MAX);

    for field in string_fields(task) {
        for token in scan_tokens(&field) {
            let TokenRef::TaskField { task_id, .. } = token else {
                continue;
            };
            let Some(_) = index_of.get(&task_id) else {
                report.push(
                    Diagnostic::error(
                        "L2::dangling_reference",
                        format!("@{}_*@ references an undeclared task", task_id),
                    )
                    .with_task(task.id)
                    .with_line(task.source_line),
                );
                continue;
            };
            // Completion position: a subtask completes within its owner.
            let writer_position = owner_of
                .get(&task_id)
                .and_then(|owner| index_of.get(owner))
                .or_else(|| index_of.get(&task_id))
                .copied()
                .unwrap_or(usize::MAX);
            if writer_position >= reader_position {
                report.push(
                    Diagnostic::error(
                        "L2::dependency_direction",
                        format!(
                            "reference to task {} cannot be satisfied before task {} runs",
                            task_id, task.id
                        ),
                    )
                    .with_task(task.id)
                    .with_line(task.source_line),
                );
            }
        }
    }
}

/// Warn when an owned subtask is reachable by sequential fall-through
/// from the task declared immediately before it.
fn check_ownership_gaps(
    parsed: &ParsedFile,
    owner_of: &HashMap<u32, u32>,
    report: &mut DiagnosticReport,
) {
    for window in parsed.tasks.windows(2) {
        let (previous, candidate) = (&window[0], &window[1]);
        let Some(owner) = owner_of.get(&candidate.id) else {
            continue;
        };
        if owner_of.contains_key(&previous.id) {
            // Inside the same subtask block; the block entrance was
            // already audited.
            continue;
        }
        let diverts = previous.kind == TaskKind::Return
            || matches!(
                previous.next,
                Some(crate::core::task::NextRule::Never | crate::core::task::NextRule::Loop)
            )
            || (previous.on_success.is_some() && previous.on_failure.is_some());
        if !diverts {
            report.push(
                Diagnostic::warning(
                    "L2::ownership_gap",
                    format!(
                        "task {} owned by task {} is reachable by fall-through from task {}; insert a firewall task with return=N",
                        candidate.id, owner, previous.id
                    ),
                )
                .with_task(candidate.id)
                .with_line(candidate.source_line),
            );
        }
    }
}

fn string_fields(task: &Task) -> Vec<String> {
    let mut fields = Vec::new();
    fields.extend(task.hostname.clone());
    fields.extend(task.command.clone());
    fields.extend(task.arguments.clone());
    fields.extend(task.condition.clone());
    fields.extend(task.success.clone());
    fields.extend(task.env_overrides.iter().map(|(_, v)| v.clone()));
    fields
}
