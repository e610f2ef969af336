//! Terminal output helpers for the TASKER CLI.
//!
//! Thin wrappers around `colored` so every command renders findings and
//! progress the same way.
use crate::core::task::{Task, TaskKind};
use crate::core::validator::{DiagnosticReport, Severity};
use colored::Colorize;

/// Print a success message with a green checkmark.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message with a red cross.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message with a yellow marker.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Render a diagnostics report in its deterministic order, colored by
/// severity, followed by the counts line.
pub fn render_diagnostics(report: &DiagnosticReport) {
    for diagnostic in report.sorted() {
        let line = diagnostic.to_string();
        match diagnostic.severity {
            Severity::Error => eprintln!("{}", line.red()),
            Severity::Warning => println!("{}", line.yellow()),
            Severity::Info => println!("{}", line.dimmed()),
        }
    }
    if !report.is_empty() {
        println!("{}", report.summary());
    }
}

/// Render the validated execution plan without executing anything.
pub fn render_plan(tasks: &[Task]) {
    println!("{}", "Execution plan".bold());
    for task in tasks {
        let mut line = format!("  task {:<4} {}", task.id, task.kind);
        if let Some(command) = &task.command {
            line.push_str(&format!("  {}", command));
            if let Some(arguments) = &task.arguments {
                line.push_str(&format!(" {}", arguments));
            }
        }
        match task.kind {
            TaskKind::Parallel => {
                line.push_str(&format!(
                    "  subtasks={:?} max_parallel={}",
                    task.subtask_ids,
                    task.max_parallel
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "all".to_string())
                ));
            }
            TaskKind::Conditional => {
                line.push_str(&format!(
                    "  if_true={:?} if_false={:?}",
                    task.if_true_tasks, task.if_false_tasks
                ));
            }
            TaskKind::Return => {
                line.push_str(&format!(
                    "  exit={}",
                    task.return_code_override.unwrap_or(0)
                ));
            }
            _ => {}
        }
        let mut edges = Vec::new();
        if let Some(target) = task.on_success {
            edges.push(format!("on_success→{}", target));
        }
        if let Some(target) = task.on_failure {
            edges.push(format!("on_failure→{}", target));
        }
        if let Some(next) = task.next {
            edges.push(format!("next={:?}", next).to_lowercase());
        }
        if !edges.is_empty() {
            line.push_str(&format!("  [{}]", edges.join(" ")));
        }
        println!("{}", line);
    }
}
