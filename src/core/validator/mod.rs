//! Pre-execution validation of parsed task files.
//!
//! Validation runs in five layers, applied in order; a layer that produces
//! errors stops the pass so later layers never see structurally broken
//! input:
//!
//! - L1 syntax: unique ids, recognized values (most of this is enforced
//!   while parsing; the residue lives in `syntax`)
//! - L2 semantics: target existence, required fields per kind, expression
//!   parses, dependency direction, subtask ownership
//! - L3 security: injection shapes, encoded attacks, traversal, length
//!   caps, applied after expanding compile-time-known globals
//! - L4 runtime probes: command on PATH, host reachability (skippable)
//! - L5 execution safety: bounds and deprecation warnings
//!
//! The validator is pure aside from the L4 probes and fails closed: any
//! error finding maps to exit code 20.
mod diagnostics;
mod probes;
mod safety;
mod security;
mod semantics;
mod syntax;

pub use diagnostics::{Diagnostic, DiagnosticReport, Severity};

use crate::core::parser::ParsedFile;

/// Knobs controlling which layers run.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Skip the L3 security layer entirely.
    pub skip_security: bool,
    /// Skip the L4 runtime probes (PATH lookup, host reachability).
    pub skip_probes: bool,
}

/// Run all validation layers over a parsed file.
///
/// The returned report includes the parser's own findings; running the
/// same file through twice yields an identical report.
pub fn validate(parsed: &ParsedFile, options: &ValidateOptions) -> DiagnosticReport {
    let mut report = parsed.diagnostics.clone();
    if report.has_errors() {
        return report;
    }

    syntax::check(parsed, &mut report);
    if report.has_errors() {
        return report;
    }

    semantics::check(parsed, &mut report);
    if report.has_errors() {
        return report;
    }

    if options.skip_security {
        report.push(Diagnostic::info(
            "L3::skipped",
            "security validation skipped by request",
        ));
    } else {
        security::check(parsed, &mut report);
        if report.has_errors() {
            return report;
        }
    }

    if options.skip_probes {
        report.push(Diagnostic::info(
            "L4::skipped",
            "runtime probes skipped by request",
        ));
    } else {
        probes::check(parsed, &mut report);
        if report.has_errors() {
            return report;
        }
    }

    safety::check(parsed, &mut report);
    report
}
