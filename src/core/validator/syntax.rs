//! L1 syntax checks.
//!
//! Line shapes, key spellings, and value types are enforced while parsing;
//! what remains here are the cross-line rules: id uniqueness and the
//! one-header-per-task guarantee the parser's region machine already
//! upholds.
use super::{Diagnostic, DiagnosticReport};
use crate::core::parser::ParsedFile;
use std::collections::HashSet;

pub(super) fn check(parsed: &ParsedFile, report: &mut DiagnosticReport) {
    let mut seen: HashSet<u32> = HashSet::new();
    for task in &parsed.tasks {
        if !seen.insert(task.id) {
            report.push(
                Diagnostic::error(
                    "L1::duplicate_id",
                    format!("task id {} declared more than once", task.id),
                )
                .with_task(task.id)
                .with_line(task.source_line),
            );
        }
    }
}
