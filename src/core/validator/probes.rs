//! L4 runtime probes.
//!
//! The only validation layer with side effects beyond reading the file:
//! commands for `local` tasks must exist on PATH, remote modes need their
//! wrapper program installed, and hostnames must resolve. All of it is
//! skippable with `--skip-host-validation`.
use super::{Diagnostic, DiagnosticReport};
use crate::core::parser::ParsedFile;
use crate::core::task::{ExecMode, TaskKind};
use crate::core::variables::expand_known_globals;
use crate::services::hosts;
use std::collections::HashSet;

pub(super) fn check(parsed: &ParsedFile, report: &mut DiagnosticReport) {
    // Probe each wrapper and hostname once, not once per task.
    let mut probed_hosts: HashSet<String> = HashSet::new();
    let mut missing_wrappers: HashSet<&'static str> = HashSet::new();

    for task in &parsed.tasks {
        if task.kind != TaskKind::Sequential {
            continue;
        }

        match task.exec_mode {
            ExecMode::Local => {
                if let Some(command) = &task.command {
                    let command = expand_known_globals(command, &parsed.globals);
                    // A command that still carries a runtime token cannot
                    // be probed ahead of execution.
                    if !command.contains('@') && !hosts::command_on_path(&command) {
                        report.push(
                            Diagnostic::error(
                                "L4::command_missing",
                                format!("command '{}' not found on PATH", command),
                            )
                            .with_task(task.id)
                            .with_line(task.source_line),
                        );
                    }
                }
            }
            ExecMode::Shell => {}
            mode => {
                let wrapper = mode.wrapper_program().expect("remote mode has a wrapper");
                if !hosts::command_on_path(wrapper) && missing_wrappers.insert(wrapper) {
                    report.push(
                        Diagnostic::error(
                            "L4::wrapper_missing",
                            format!("execution wrapper '{}' not found on PATH", wrapper),
                        )
                        .with_task(task.id)
                        .with_line(task.source_line),
                    );
                }
                if let Some(hostname) = &task.hostname {
                    let hostname = expand_known_globals(hostname, &parsed.globals);
                    if !hostname.contains('@') && probed_hosts.insert(hostname.clone()) {
                        if let Err(reason) = hosts::probe_host(&hostname) {
                            report.push(
                                Diagnostic::error("L4::host_unreachable", reason)
                                    .with_task(task.id)
                                    .with_line(task.source_line),
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_str;

    fn run(text: &str) -> DiagnosticReport {
        let parsed = parse_str(text);
        assert!(!parsed.diagnostics.has_errors(), "parse failed");
        let mut report = DiagnosticReport::new();
        check(&parsed, &mut report);
        report
    }

    #[test]
    fn test_missing_local_command() {
        let report = run("task=0\ncommand=tasker-no-such-binary-xyz\nexec=local\n");
        assert!(report.iter().any(|d| d.rule == "L4::command_missing"));
    }

    #[test]
    fn test_present_local_command() {
        let report = run("task=0\ncommand=echo\nexec=local\n");
        assert!(!report.has_errors(), "{}", report.render());
    }

    #[test]
    fn test_missing_wrapper_reported_once() {
        let report = run(
            "task=0\nhostname=localhost\ncommand=uptime\nexec=pbrun\n\
             task=1\nhostname=localhost\ncommand=uptime\nexec=pbrun\n",
        );
        let wrapper_findings = report
            .iter()
            .filter(|d| d.rule == "L4::wrapper_missing")
            .count();
        assert!(wrapper_findings <= 1);
    }

    #[test]
    fn test_runtime_tokens_not_probed() {
        let report = run("task=0\ncommand=@0_stdout@\nexec=local\n");
        assert!(!report.iter().any(|d| d.rule == "L4::command_missing"));
    }
}
