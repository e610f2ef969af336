//! L5 execution-safety checks.
//!
//! Bounds that only matter once a file is about to run: timeout limits,
//! retry plausibility, and deprecation warnings for key combinations the
//! engine resolves in a fixed direction.
use super::{Diagnostic, DiagnosticReport};
use crate::core::parser::ParsedFile;
use crate::core::task::TaskKind;

/// Largest accepted per-task timeout (24 hours).
pub const MAX_TIMEOUT_SECONDS: u64 = 86_400;

pub(super) fn check(parsed: &ParsedFile, report: &mut DiagnosticReport) {
    for task in &parsed.tasks {
        if let Some(timeout) = task.timeout_seconds {
            if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout) {
                report.push(
                    Diagnostic::error(
                        "L5::timeout_bound",
                        format!(
                            "timeout {}s outside the accepted range [1, {}]",
                            timeout, MAX_TIMEOUT_SECONDS
                        ),
                    )
                    .with_task(task.id)
                    .with_line(task.source_line),
                );
            }
        }

        if task.next.is_some() && (task.on_success.is_some() || task.on_failure.is_some()) {
            report.push(
                Diagnostic::warning(
                    "L5::deprecated_routing",
                    "both next and explicit on_success/on_failure set; explicit routing wins",
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }

        if task.loop_break && task.loop_count.is_none() {
            report.push(
                Diagnostic::warning(
                    "L5::loop_break",
                    "loop_break without a loop count has no effect",
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }

        if matches!(task.next, Some(crate::core::task::NextRule::Loop))
            && task.loop_count.is_none()
        {
            report.push(
                Diagnostic::error(
                    "L5::loop_count",
                    "next=loop requires a loop count",
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }

        if task.retry_failed && !matches!(task.kind, TaskKind::Parallel | TaskKind::Conditional) {
            report.push(
                Diagnostic::warning(
                    "L5::retry_failed",
                    "retry_failed only applies to parallel/conditional aggregates",
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }

        if task.retry_count > 0 && task.retry_delay_seconds > 300.0 {
            report.push(
                Diagnostic::warning(
                    "L5::retry_delay",
                    format!(
                        "retry_delay of {}s will stall the workflow noticeably",
                        task.retry_delay_seconds
                    ),
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }
    }
}
