//! Child-process execution for the task strategies.
//!
//! Every executable task goes through [`run_child`]: the child gets its
//! own process group so the timeout and cancellation ladders can signal
//! the whole tree (SIGTERM, a grace period, then SIGKILL), stdin is
//! `/dev/null`, and both output streams are drained by dedicated capture
//! tasks so a child can never deadlock on a full pipe while the engine
//! waits for its exit.
use crate::Result;
use crate::core::output::{CaptureSettings, CleanupRegistry, OutputHandle, StreamKind, capture_stream};
use crate::core::scheduler::CancelControl;
use crate::core::task::ExecMode;
use crate::error::TaskerError;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Wait between SIGTERM and SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Exit-code sentinel for a child that could not be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// A fully expanded, ready-to-spawn child invocation.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Rendering for logs and error messages.
    pub display: String,
    pub env_overrides: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl ChildSpec {
    /// Assemble the argv for an execution mode from the task's expanded
    /// hostname / command / arguments fields.
    ///
    /// `local` runs the command directly; `shell` hands the whole line to
    /// one `sh -c` invocation; the remote modes prepend their wrapper
    /// program and the hostname as an opaque argv prefix.
    pub fn assemble(
        mode: ExecMode,
        hostname: Option<&str>,
        command: &str,
        arguments: Option<&str>,
    ) -> Self {
        let split_args: Vec<String> = arguments
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let (program, args) = match mode {
            ExecMode::Local => (command.to_string(), split_args),
            ExecMode::Shell => {
                let line = match arguments {
                    Some(arguments) if !arguments.is_empty() => {
                        format!("{} {}", command, arguments)
                    }
                    _ => command.to_string(),
                };
                ("sh".to_string(), vec!["-c".to_string(), line])
            }
            ExecMode::Pbrun | ExecMode::P7s | ExecMode::Wwrs => {
                let wrapper = mode.wrapper_program().expect("remote mode has a wrapper");
                let mut args = Vec::new();
                if let Some(hostname) = hostname {
                    args.push(hostname.to_string());
                }
                args.push(command.to_string());
                args.extend(split_args);
                (wrapper.to_string(), args)
            }
        };

        let display = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            program,
            args,
            display,
            env_overrides: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, env_overrides: Vec<(String, String)>) -> Self {
        self.env_overrides = env_overrides;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What happened to a spawned child.
#[derive(Debug)]
pub struct ChildOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub signaled: bool,
    /// The workflow's cancellation fired while this child ran.
    pub cancelled: bool,
    pub stdout: OutputHandle,
    pub stderr: OutputHandle,
    pub duration_seconds: f64,
}

/// Spawn a child and wait for it, enforcing the timeout and cancellation
/// ladders. Output capture always runs to stream EOF so the pipes are
/// fully drained even for killed children.
pub async fn run_child(
    spec: &ChildSpec,
    settings: &CaptureSettings,
    registry: &Arc<CleanupRegistry>,
    cancel: &CancelControl,
) -> Result<ChildOutcome> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (name, value) in &spec.env_overrides {
        command.env(name, value);
    }

    // A fresh session makes the child a process-group leader, so the
    // whole tree is reachable with one killpg.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| TaskerError::spawn(&spec.display, e.to_string()))?;
    let pid = child.id();

    let stdout_task = {
        let reader = child.stdout.take().expect("stdout piped");
        let settings = settings.clone();
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            capture_stream(reader, StreamKind::Stdout, &settings, &registry).await
        })
    };
    let stderr_task = {
        let reader = child.stderr.take().expect("stderr piped");
        let settings = settings.clone();
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            capture_stream(reader, StreamKind::Stderr, &settings, &registry).await
        })
    };

    let timeout = spec.timeout;
    let mut timed_out = false;
    let mut cancelled = false;

    enum WaitEnd {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }
    let cancel_token = cancel.token();
    let end = tokio::select! {
        status = child.wait() => WaitEnd::Exited(status),
        _ = sleep_or_forever(timeout) => WaitEnd::TimedOut,
        _ = cancel_token.cancelled() => WaitEnd::Cancelled,
    };
    let status = match end {
        WaitEnd::Exited(status) => status?,
        WaitEnd::TimedOut => {
            timed_out = true;
            terminate(&mut child, pid, cancel).await?
        }
        WaitEnd::Cancelled => {
            cancelled = true;
            terminate(&mut child, pid, cancel).await?
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| TaskerError::internal(format!("stdout capture task failed: {}", e)))??;
    let stderr = stderr_task
        .await
        .map_err(|e| TaskerError::internal(format!("stderr capture task failed: {}", e)))??;

    let mut signaled = false;
    let exit_code = if timed_out {
        crate::core::results::TIMEOUT_EXIT_CODE
    } else {
        match status.code() {
            Some(code) => code,
            None => {
                signaled = true;
                signal_exit_code(&status)
            }
        }
    };

    Ok(ChildOutcome {
        exit_code,
        timed_out,
        signaled,
        cancelled,
        stdout,
        stderr,
        duration_seconds: start.elapsed().as_secs_f64(),
    })
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM the child's process group, wait out the grace period (skipped
/// entirely when hard cancellation is already set), then SIGKILL.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    cancel: &CancelControl,
) -> Result<std::process::ExitStatus> {
    signal_group(child, pid, false);

    let hard = cancel.hard_token();
    if !hard.is_cancelled() {
        let reaped = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(GRACE_PERIOD) => None,
            _ = hard.cancelled() => None,
        };
        if let Some(status) = reaped {
            return Ok(status);
        }
    }

    signal_group(child, pid, true);
    Ok(child.wait().await?)
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, kill: bool) {
    if let Some(pid) = pid {
        let signal = if kill { libc::SIGKILL } else { libc::SIGTERM };
        unsafe {
            libc::killpg(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _kill: bool) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    128 + status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &std::process::ExitStatus) -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn harness(dir: &TempDir) -> (CaptureSettings, Arc<CleanupRegistry>, CancelControl) {
        let settings = CaptureSettings {
            temp_dir: dir.path().to_path_buf(),
            ..CaptureSettings::default()
        };
        (settings, Arc::new(CleanupRegistry::new()), CancelControl::new())
    }

    #[test]
    fn test_assemble_local() {
        let spec = ChildSpec::assemble(ExecMode::Local, None, "echo", Some("Hello world"));
        assert_eq!(spec.program, "echo");
        assert_eq!(spec.args, vec!["Hello", "world"]);
        assert_eq!(spec.display, "echo Hello world");
    }

    #[test]
    fn test_assemble_shell_single_invocation() {
        let spec = ChildSpec::assemble(ExecMode::Shell, None, "ls /tmp", Some("| wc -l"));
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "ls /tmp | wc -l"]);
    }

    #[test]
    fn test_assemble_remote_prefix() {
        let spec = ChildSpec::assemble(ExecMode::Pbrun, Some("db01"), "uptime", None);
        assert_eq!(spec.program, "pbrun");
        assert_eq!(spec.args, vec!["db01", "uptime"]);
    }

    #[tokio::test]
    async fn test_run_child_captures_output() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Local, None, "echo", Some("Hello"));
        let outcome = run_child(&spec, &settings, &registry, &cancel).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        let (text, truncated) = outcome.stdout.text_for_substitution().unwrap();
        assert_eq!(text, "Hello");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_run_child_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Shell, None, "exit 3", None);
        let outcome = run_child(&spec, &settings, &registry, &cancel).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Local, None, "sleep", Some("60"))
            .with_timeout(Some(Duration::from_millis(200)));
        let start = Instant::now();
        let outcome = run_child(&spec, &settings, &registry, &cancel).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, crate::core::results::TIMEOUT_EXIT_CODE);
        // SIGTERM stops `sleep` well inside the grace period.
        assert!(start.elapsed() < GRACE_PERIOD + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancellation_stops_child() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Local, None, "sleep", Some("60"));

        let cancel_handle = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_handle.cancel(Some(crate::error::CancelSignal::Terminate));
        });

        let outcome = run_child(&spec, &settings, &registry, &cancel).await.unwrap();
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Local, None, "tasker-no-such-binary", None);
        let err = run_child(&spec, &settings, &registry, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_env_overrides_reach_child() {
        let dir = TempDir::new().unwrap();
        let (settings, registry, cancel) = harness(&dir);
        let spec = ChildSpec::assemble(ExecMode::Shell, None, "printf %s \"$GREETING\"", None)
            .with_env(vec![("GREETING".to_string(), "hi-from-env".to_string())]);
        let outcome = run_child(&spec, &settings, &registry, &cancel).await.unwrap();
        let (text, _) = outcome.stdout.text_for_substitution().unwrap();
        assert_eq!(text, "hi-from-env");
    }
}
