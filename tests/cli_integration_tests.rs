// tests/cli_integration_tests.rs
//
// Full binary runs: flag surface, exit codes, and the reporting files.
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tasker() -> Command {
    Command::cargo_bin("tasker").unwrap()
}

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_version_display() {
    tasker()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tasker"));
}

#[test]
fn test_help_display() {
    tasker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("task-file workflows"));
}

#[test]
fn test_validate_only_success_exits_zero() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "ok.txt",
        "task=0\ncommand=echo\narguments=hi\nexec=local\n",
    );
    tasker()
        .arg(&file)
        .arg("--skip-host-validation")
        .assert()
        .success()
        .stdout(predicate::str::contains("validation passed"));
}

#[test]
fn test_security_rejection_exits_twenty() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "evil.txt",
        "task=0\ncommand=echo\narguments=; rm -rf /\nexec=local\n",
    );
    tasker()
        .arg(&file)
        .arg("-r")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .failure()
        .code(20)
        .stderr(predicate::str::contains("L3::injection"));
}

#[test]
fn test_empty_file_exits_twenty_four() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "empty.txt", "# no tasks here\n");
    tasker().arg(&file).assert().failure().code(24);
}

#[test]
fn test_missing_file_fails() {
    tasker()
        .arg("/no/such/tasker/file.txt")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_run_sequential_hello() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "hello.txt",
        "task=0\nhostname=localhost\ncommand=echo\narguments=Hello\nexec=local\n",
    );
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .success();

    // One timestamped log file appeared under the log dir.
    let logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".log"))
        .collect();
    assert_eq!(logs.len(), 1);
    let contents = std::fs::read_to_string(logs[0].path()).unwrap();
    assert!(contents.contains("START task=0"));
    assert!(contents.contains("SUCCESS exit=0"));
}

#[test]
fn test_next_never_exits_five() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "never.txt",
        "task=0\ncommand=echo\narguments=done\nnext=never\n",
    );
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .code(5);
}

#[test]
fn test_dependency_failure_exits_twenty_one() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "dep.txt",
        "task=0\ncommand=echo\narguments=yes\n\
         task=1\ncommand=echo\narguments=x\ncondition=@0_stdout@=no\n\
         task=2\ncommand=echo\narguments=@1_stdout@\n",
    );
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .code(21);
}

#[test]
fn test_output_json_report() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "report.txt",
        "SECRET_DEPLOY_KEY=abc123\ntask=0\ncommand=echo\narguments=payload\n",
    );
    let json_path = dir.path().join("run.json");
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .arg(format!("--output-json={}", json_path.display()))
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .success();

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(report["execution_summary"]["exit_code"], 0);
    assert_eq!(report["execution_summary"]["execution_path"][0], 0);
    assert_eq!(report["task_results"][0]["stdout"], "payload\n");
    // Masked variables never materialize in the report.
    assert_eq!(report["variables"]["SECRET_DEPLOY_KEY"], "***");
}

#[test]
fn test_project_summary_appended() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "flow.txt", "task=0\ncommand=echo\narguments=ok\n");
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .arg("--project=release")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .success();

    let summary = dir.path().join("project").join("release.summary");
    let contents = std::fs::read_to_string(&summary).unwrap();
    assert!(contents.contains("SUCCESS\t0\t"));
}

#[test]
fn test_show_plan_executes_nothing() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran.marker");
    let file = write(
        &dir,
        "plan.txt",
        &format!("task=0\ncommand=touch {}\nexec=shell\n", marker.display()),
    );
    tasker()
        .arg(&file)
        .arg("--show-plan")
        .arg("--skip-host-validation")
        .assert()
        .success()
        .stdout(predicate::str::contains("Execution plan"));
    assert!(!marker.exists(), "show-plan must not spawn children");
}

#[test]
fn test_file_defined_args_apply() {
    let dir = TempDir::new().unwrap();
    // The file pins --skip-host-validation, so the unresolvable command
    // probe is skipped even though the flag is not on the command line.
    let file = write(
        &dir,
        "pinned.txt",
        "--skip-host-validation\ntask=0\ncommand=tasker-test-no-such-binary\nexec=local\n",
    );
    tasker().arg(&file).assert().success();
}

#[test]
fn test_auto_recovery_file_lifecycle() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "rec.txt", "task=0\ncommand=echo\narguments=ok\n");
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .arg("--auto-recovery")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .success();

    // Deleted on terminal success.
    let recovery_dir = dir.path().join("recovery");
    let leftover = std::fs::read_dir(&recovery_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[test]
fn test_auto_recovery_retained_on_failure() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "fail.txt",
        "task=0\ncommand=echo\narguments=ok\n\
         task=1\ncommand=false\n",
    );
    tasker()
        .arg(&file)
        .arg("-r")
        .arg("--skip-host-validation")
        .arg("--auto-recovery")
        .env("TASKER_LOG_DIR", dir.path())
        .assert()
        .code(1);

    let recovery_dir = dir.path().join("recovery");
    let saved = std::fs::read_dir(&recovery_dir).unwrap().count();
    assert_eq!(saved, 1, "state file retained for resume");
}
