//! Execution command (`-r`): validate, wire the services, run the
//! engine, and flush every reporting surface.
use super::load_and_validate;
use crate::Result;
use crate::cli::{Cli, Exit, ui};
use crate::core::engine::{EngineOptions, ExecutionEngine, WorkflowOutcome};
use crate::core::scheduler::{CancelControl, PoolPolicy};
use crate::error::{CancelSignal, TaskerError};
use crate::services::{alert, json_output, logging, recovery, summary};
use std::path::PathBuf;
use std::sync::Arc;

/// Global variable that sets the workflow-wide master timeout.
pub const MASTER_TIMEOUT_GLOBAL: &str = "MASTER_TIMEOUT";

pub async fn execute(cli: &Cli) -> Result<Exit> {
    let (parsed, report) = load_and_validate(cli)?;
    ui::render_diagnostics(&report);
    if report.has_errors() {
        return Err(TaskerError::validation(report.summary()));
    }

    let log_dir = logging::default_log_dir();
    let logger = Arc::new(logging::RunLogger::create(&log_dir, &cli.task_file)?);
    logger.workflow_start(&cli.task_file, parsed.tasks.len());

    let master_timeout = parsed
        .globals
        .get(MASTER_TIMEOUT_GLOBAL)
        .and_then(|value| value.parse::<u64>().ok());

    // Recovery: load saved state only when both requested and accepted.
    let store = recovery::RecoveryStore::for_file(&log_dir, &cli.task_file);
    let mut resumed_state: Option<recovery::RecoveryState> = None;
    if cli.auto_recovery {
        if let Some(state) = store.load()? {
            if cli.accept_recovery {
                log::info!(
                    "resuming: {} completed task(s) restored from {}",
                    state.completed.len(),
                    store.path().display()
                );
                resumed_state = Some(state);
            } else {
                ui::print_warning(
                    "recovery state found but not accepted; pass -y to resume from it",
                );
            }
        }
    }

    let declared_order: Vec<u32> = parsed.tasks.iter().map(|t| t.id).collect();
    let start_from = cli.start_from.or_else(|| {
        resumed_state
            .as_ref()
            .and_then(|state| state.resume_cursor(&declared_order))
    });

    let options = EngineOptions {
        capture_settings: Default::default(),
        policy: PoolPolicy::from_env(),
        start_from,
        master_timeout,
    };
    let cancel = CancelControl::new();
    let mut engine = ExecutionEngine::new(parsed.tasks.clone(), parsed.globals.clone(), options)
        .with_cancel(cancel.clone());

    if let Some(state) = &resumed_state {
        for (id, recovered) in &state.completed {
            engine.preload_result(recovered.hydrate(*id));
        }
    }

    engine.add_observer(logger.clone());
    if cli.auto_recovery {
        let writer = recovery::RecoveryWriter::new(
            recovery::RecoveryStore::for_file(&log_dir, &cli.task_file),
            &cli.task_file,
            resumed_state,
        );
        engine.add_observer(Arc::new(writer));
    }

    install_signal_handlers(cancel.clone());

    let outcome = engine.run().await;
    logger.workflow_end(&outcome, engine.results());

    if let Some(path) = &cli.output_json {
        let path = resolve_json_path(path, &log_dir, cli);
        let report = json_output::build_report(
            &cli.task_file,
            cli.project.as_deref(),
            &outcome,
            engine.results(),
            engine.globals(),
        );
        match json_output::write_report(&path, &report) {
            Ok(()) => log::info!("JSON report written to {}", path.display()),
            Err(e) => log::warn!("failed to write JSON report: {}", e),
        }
    }

    if let Some(project) = &cli.project {
        write_summary(cli, project, &log_dir, &engine, &outcome, logger.path());
    }

    if cli.auto_recovery && outcome.success {
        store.delete();
    }

    // All reporting surfaces have read their handles; drop the temp files.
    let removed = engine.registry().remove_all();
    log::debug!("removed {} temp file(s) at workflow end", removed);

    if !outcome.success {
        if let Some(error) = &outcome.error {
            ui::print_error(error);
        }
        if cli.fire_and_forget {
            log::debug!("fire-and-forget: skipping alert hook");
        } else {
            let state_file = cli.auto_recovery.then(|| store.path().to_path_buf());
            alert::fire(&alert::AlertContext {
                task_file: &cli.task_file,
                failed_task: outcome.final_task_id,
                exit_code: outcome.exit_code,
                error: outcome.error.as_deref().unwrap_or("workflow failed"),
                log_file: Some(logger.path()),
                state_file: state_file.as_deref(),
            })
            .await;
        }
    } else {
        ui::print_success(&format!(
            "workflow completed (exit {}), log: {}",
            outcome.exit_code,
            logger.path().display()
        ));
    }

    Ok(Exit(outcome.exit_code))
}

fn resolve_json_path(requested: &PathBuf, log_dir: &std::path::Path, cli: &Cli) -> PathBuf {
    if requested.as_os_str().is_empty() {
        json_output::default_output_path(log_dir, &cli.task_file)
    } else {
        requested.clone()
    }
}

fn write_summary(
    cli: &Cli,
    project: &str,
    log_dir: &std::path::Path,
    engine: &ExecutionEngine,
    outcome: &WorkflowOutcome,
    log_file: &std::path::Path,
) {
    let final_task = outcome.final_task_id.and_then(|id| engine.task(id));
    let task_file = cli.task_file.display().to_string();
    let log_file = log_file.display().to_string();
    let record = summary::SummaryRecord {
        status: if outcome.success { "SUCCESS" } else { "FAILURE" },
        exit_code: outcome.exit_code,
        task_file: &task_file,
        final_task_id: outcome.final_task_id,
        hostname: final_task.and_then(|t| t.hostname.as_deref()).unwrap_or("-"),
        command: final_task.and_then(|t| t.command.as_deref()).unwrap_or("-"),
        log_file: &log_file,
    };
    if let Err(e) = summary::append(log_dir, project, &record) {
        log::warn!("failed to append project summary: {}", e);
    }
}

/// Wire SIGINT/SIGTERM into the cancellation fabric. A second signal
/// escalates to the hard stage (immediate SIGKILL of children).
fn install_signal_handlers(cancel: CancelControl) {
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            log::warn!("SIGINT received, cancelling workflow");
            interrupt.cancel(Some(CancelSignal::Interrupt));
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            return;
        };
        while terminate.recv().await.is_some() {
            log::warn!("SIGTERM received, cancelling workflow");
            cancel.cancel(Some(CancelSignal::Terminate));
        }
    });
}
