//! Diagnostics report shared by the parser and the validation layers.
use std::fmt;

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational note, never blocks execution.
    Info,
    /// Suspicious but legal; execution proceeds.
    Warning,
    /// Blocks execution; the workflow fails closed with exit 20.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single finding produced by the parser or a validation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Validation rule identifier, e.g. `L3::injection`.
    pub rule: String,
    /// The task the finding is attached to, if any.
    pub task_id: Option<u32>,
    /// 1-based source line, when known.
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn error<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self {
            severity: Severity::Error,
            rule: rule.into(),
            task_id: None,
            line: None,
            message: message.into(),
        }
    }

    pub fn warning<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self {
            severity: Severity::Warning,
            rule: rule.into(),
            task_id: None,
            line: None,
            message: message.into(),
        }
    }

    pub fn info<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self {
            severity: Severity::Info,
            rule: rule.into(),
            task_id: None,
            line: None,
            message: message.into(),
        }
    }

    pub fn with_task(mut self, task_id: u32) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.severity, self.rule)?;
        if let Some(id) = self.task_id {
            write!(f, " task {}", id)?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// The collected findings of a parse + validate pass.
///
/// Rendering is deterministic: findings are sorted by task id, then rule,
/// then message, so validating the same file twice yields byte-identical
/// reports.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticReport {
    items: Vec<Diagnostic>,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: DiagnosticReport) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Findings in deterministic order.
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut refs: Vec<&Diagnostic> = self.items.iter().collect();
        refs.sort_by(|a, b| {
            a.task_id
                .cmp(&b.task_id)
                .then_with(|| a.rule.cmp(&b.rule))
                .then_with(|| a.message.cmp(&b.message))
        });
        refs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// One-line summary used in error messages and logs.
    pub fn summary(&self) -> String {
        format!(
            "{} error(s), {} warning(s)",
            self.error_count(),
            self.warning_count()
        )
    }

    /// Full multi-line rendering in deterministic order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for diagnostic in self.sorted() {
            out.push_str(&diagnostic.to_string());
            out.push('\n');
        }
        out
    }
}
