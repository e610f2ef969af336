//! Terminal-failure alert hook.
//!
//! When a workflow ends in failure, a configured script receives the
//! failure context through environment variables. The hook is bounded by
//! a 30-second timeout and its exit code never influences the workflow's.
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Environment variable naming the hook script.
pub const ENV_ALERT_SCRIPT: &str = "TASKER_ALERT_SCRIPT";
/// Hard bound on hook runtime.
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure context handed to the hook.
#[derive(Debug, Clone)]
pub struct AlertContext<'a> {
    pub task_file: &'a Path,
    pub failed_task: Option<u32>,
    pub exit_code: i32,
    pub error: &'a str,
    pub log_file: Option<&'a Path>,
    pub state_file: Option<&'a Path>,
}

/// Fire the hook if one is configured. Best-effort: every failure mode
/// degrades to a log line.
pub async fn fire(ctx: &AlertContext<'_>) {
    let Some(script) = std::env::var_os(ENV_ALERT_SCRIPT) else {
        return;
    };
    let script = script.to_string_lossy().into_owned();
    log::info!("invoking alert hook {}", script);

    let mut command = Command::new(&script);
    command
        .env(
            "TASKER_TIMESTAMP",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        )
        .env("TASKER_TASK_FILE", ctx.task_file)
        .env(
            "TASKER_FAILED_TASK",
            ctx.failed_task
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
        .env("TASKER_EXIT_CODE", ctx.exit_code.to_string())
        .env("TASKER_ERROR", ctx.error)
        .env(
            "TASKER_LOG_FILE",
            ctx.log_file
                .map(Path::as_os_str)
                .unwrap_or(std::ffi::OsStr::new("")),
        )
        .env(
            "TASKER_STATE_FILE",
            ctx.state_file
                .map(Path::as_os_str)
                .unwrap_or(std::ffi::OsStr::new("")),
        )
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!("alert hook failed to start: {}", e);
            return;
        }
    };

    match tokio::time::timeout(ALERT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => log::info!("alert hook exited with {}", status),
        Ok(Err(e)) => log::warn!("alert hook wait failed: {}", e),
        Err(_) => {
            log::warn!("alert hook exceeded {:?}, killing", ALERT_TIMEOUT);
            let _ = child.kill().await;
        }
    }
}
