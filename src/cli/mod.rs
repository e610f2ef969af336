//! Command-line interface for the TASKER workflow engine.
//!
//! The surface is flag-based rather than subcommand-based: one positional
//! task file plus mode flags. The default action validates the file;
//! `-r` executes it; `--show-plan` renders the validated graph.
//!
//! # Examples
//!
//! ```bash
//! # Validate only
//! tasker deploy.txt
//!
//! # Execute with recovery checkpoints and a JSON report
//! tasker deploy.txt -r --auto-recovery --output-json=run.json
//!
//! # Resume a crashed run, accepting saved state
//! tasker deploy.txt -r --auto-recovery -y
//! ```
//!
//! A task file may pin defaults for these flags in its leading region
//! (lines beginning with `--`); arguments given on the real command line
//! always win.
pub mod ui;

use clap::Parser;
use std::path::PathBuf;

/// Main CLI structure defining the flag surface.
#[derive(Parser, Debug, Clone)]
#[command(name = "tasker")]
#[command(about = "Validate and execute declarative task-file workflows")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(args_override_self = true)]
pub struct Cli {
    /// Task file to validate or execute
    pub task_file: PathBuf,

    /// Execute the workflow (without this, only validation runs)
    #[arg(short = 'r')]
    pub run: bool,

    /// Validate the task file and exit
    #[arg(long)]
    pub validate_only: bool,

    /// Skip the runtime probes (command lookup, host reachability)
    #[arg(long)]
    pub skip_host_validation: bool,

    /// Skip the security validation layer
    #[arg(long)]
    pub skip_security_validation: bool,

    /// Checkpoint completed tasks for crash recovery
    #[arg(long)]
    pub auto_recovery: bool,

    /// Log level (-d alone selects debug)
    #[arg(
        short = 'd',
        long = "log-level",
        value_name = "LEVEL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "debug"
    )]
    pub log_level: Option<String>,

    /// Project name for the summary record
    #[arg(short = 'p', long, value_name = "NAME")]
    pub project: Option<String>,

    /// Write the JSON report (default path when no value given)
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "",
        value_parser = |s: &str| -> Result<PathBuf, std::convert::Infallible> { Ok(PathBuf::from(s)) }
    )]
    pub output_json: Option<PathBuf>,

    /// Start execution from this task id
    #[arg(long, value_name = "ID")]
    pub start_from: Option<u32>,

    /// Do not wait on the alert hook after a failure
    #[arg(long)]
    pub fire_and_forget: bool,

    /// Render the validated execution plan and exit
    #[arg(long)]
    pub show_plan: bool,

    /// Accept saved recovery state without prompting
    #[arg(short = 'y')]
    pub accept_recovery: bool,
}

/// Terminal exit status of a CLI invocation that did not error out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit(pub i32);

impl Exit {
    pub fn code(&self) -> i32 {
        self.0
    }
}

/// Parse arguments, merge file-defined defaults, and dispatch.
pub async fn run() -> crate::Result<Exit> {
    let cli = parse_with_file_defaults(std::env::args().collect())?;
    run_with_cli(cli).await
}

/// Dispatch a parsed CLI to its command.
pub async fn run_with_cli(cli: Cli) -> crate::Result<Exit> {
    if let Some(level) = &cli.log_level {
        apply_log_level(level);
    }

    if cli.show_plan {
        crate::commands::show_plan_command::execute(&cli)
    } else if cli.run && !cli.validate_only {
        crate::commands::run_command::execute(&cli).await
    } else {
        crate::commands::validate_command::execute(&cli)
    }
}

/// Re-parse the command line with the task file's `--` region inserted
/// before the user's own arguments, so the real command line overrides
/// the file's defaults.
pub fn parse_with_file_defaults(args: Vec<String>) -> crate::Result<Cli> {
    let cli = Cli::parse_from(&args);
    let file_defaults = leading_file_args(&cli.task_file);
    if file_defaults.is_empty() {
        return Ok(cli);
    }

    let mut merged: Vec<String> = Vec::with_capacity(args.len() + file_defaults.len());
    merged.push(args[0].clone());
    merged.extend(file_defaults);
    merged.extend(args.into_iter().skip(1));
    Cli::try_parse_from(&merged)
        .map_err(|e| crate::error::TaskerError::validation(format!(
            "file-defined arguments do not parse: {}",
            e
        )))
}

/// The `--flag` lines at the very top of a task file. Reading failures
/// are ignored here; the command itself will surface them.
fn leading_file_args(task_file: &std::path::Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(task_file) else {
        return Vec::new();
    };
    let mut args = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("--") {
            args.push(line.to_string());
        } else {
            break;
        }
    }
    args
}

fn apply_log_level(level: &str) {
    let filter = match level {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        other => {
            log::warn!("unknown log level '{}', keeping current", other);
            return;
        }
    };
    log::set_max_level(filter);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn test_default_is_validate_only() {
        let cli = parse(&["tasker", "deploy.txt"]);
        assert!(!cli.run);
        assert!(!cli.validate_only);
        assert_eq!(cli.task_file, PathBuf::from("deploy.txt"));
    }

    #[test]
    fn test_run_flag() {
        let cli = parse(&["tasker", "deploy.txt", "-r"]);
        assert!(cli.run);
    }

    #[test]
    fn test_output_json_with_and_without_path() {
        let cli = parse(&["tasker", "f.txt", "--output-json"]);
        assert_eq!(cli.output_json, Some(PathBuf::from("")));
        let cli = parse(&["tasker", "f.txt", "--output-json=/tmp/run.json"]);
        assert_eq!(cli.output_json, Some(PathBuf::from("/tmp/run.json")));
        let cli = parse(&["tasker", "f.txt"]);
        assert_eq!(cli.output_json, None);
    }

    #[test]
    fn test_log_level_shorthand() {
        let cli = parse(&["tasker", "f.txt", "-d"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        let cli = parse(&["tasker", "f.txt", "--log-level=info"]);
        assert_eq!(cli.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_file_defaults_merge_and_cli_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("flow.txt");
        std::fs::write(
            &file,
            "--skip-host-validation\n--log-level=info\nNAME=x\ntask=0\ncommand=true\n",
        )
        .unwrap();

        let cli = parse_with_file_defaults(vec![
            "tasker".to_string(),
            file.display().to_string(),
        ])
        .unwrap();
        assert!(cli.skip_host_validation);
        assert_eq!(cli.log_level.as_deref(), Some("info"));

        // The real command line overrides the file's default.
        let cli = parse_with_file_defaults(vec![
            "tasker".to_string(),
            file.display().to_string(),
            "--log-level=trace".to_string(),
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("trace"));
    }
}
