// tests/workflow_execution_tests.rs
//
// End-to-end engine scenarios: each test drives a real task file through
// the execution engine with real child processes.
mod common;

use common::WorkflowFixture;

#[tokio::test]
async fn test_sequential_hello_end_to_end() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\nhostname=localhost\ncommand=echo\narguments=Hello\nexec=local\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.success);
    assert_eq!(engine.results().execution_path(), &[0]);
    let result = engine.results().get(0).unwrap();
    assert_eq!(result.exit_code, 0);
    let (bytes, truncated) = result.stdout.read_all(usize::MAX).unwrap();
    assert_eq!(bytes, b"Hello\n");
    assert!(!truncated);
}

#[tokio::test]
async fn test_condition_false_skips_task() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=echo\narguments=yes\n\
         task=1\ncommand=echo\narguments=no-child-spawned\ncondition=@0_stdout@=no\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0);
    assert!(engine.results().contains(0));
    assert!(!engine.results().contains(1), "skipped task has no result");
    assert_eq!(engine.results().execution_path(), &[0]);
}

#[tokio::test]
async fn test_parallel_quorum_with_concurrency_ceiling() {
    let fixture = WorkflowFixture::new();
    let marks = fixture.path().join("marks");
    std::fs::create_dir(&marks).unwrap();

    // Each subtask records its interval; task 12 exits 1.
    let subtask = |id: u32, exit: i32| {
        format!(
            "task={id}\ncommand=date +%s%N > {dir}/start_{id}; sleep 0.4; date +%s%N > {dir}/end_{id}; exit {exit}\nexec=shell\n",
            id = id,
            dir = marks.display(),
            exit = exit
        )
    };
    let text = format!(
        "task=5\ntype=parallel\ntasks=10,11,12\nmax_parallel=2\nsuccess=min_success=2\n\
         task=9\ntype=return\nreturn=0\n{}{}{}",
        subtask(10, 0),
        subtask(11, 0),
        subtask(12, 1)
    );
    let mut engine = fixture.engine(&text);
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let aggregate = engine.results().get(5).unwrap();
    let counters = aggregate.aggregate.unwrap();
    assert_eq!(counters.total, 3);
    assert_eq!(counters.succeeded, 2);
    assert_eq!(counters.failed, 1);
    assert!(aggregate.success);

    // Reconstruct intervals and verify at most two ran at once.
    let read_ns = |name: String| -> u128 {
        std::fs::read_to_string(marks.join(name))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    };
    let intervals: Vec<(u128, u128)> = [10u32, 11, 12]
        .iter()
        .map(|id| (read_ns(format!("start_{}", id)), read_ns(format!("end_{}", id))))
        .collect();
    for (index, (start, _)) in intervals.iter().enumerate() {
        let concurrent = intervals
            .iter()
            .filter(|(other_start, other_end)| other_start <= start && start < other_end)
            .count();
        assert!(
            concurrent <= 2,
            "subtask {} overlapped with {} others",
            index,
            concurrent - 1
        );
    }
}

#[tokio::test]
async fn test_timeout_sends_sigterm_within_grace() {
    let fixture = WorkflowFixture::new();
    let start = std::time::Instant::now();
    let mut engine = fixture.engine(
        "task=0\ncommand=sleep\narguments=60\ntimeout=2\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 1, "unrouted timeout fails the workflow");
    let result = engine.results().get(0).unwrap();
    assert!(result.timed_out);
    assert_eq!(result.exit_code, 124);
    assert!(
        start.elapsed() < std::time::Duration::from_secs(7),
        "timeout + grace must stay under 7s, took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_spillover_and_cross_task_file_reference() {
    let fixture = WorkflowFixture::new();
    const FIVE_MIB: usize = 5 * 1024 * 1024;
    let text = format!(
        "task=0\ncommand=head -c {} /dev/zero\nexec=shell\n\
         task=1\ncommand=wc\narguments=-c @0_stdout_file@\nexec=local\n",
        FIVE_MIB
    );
    let mut engine = fixture.engine(&text);
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let producer = engine.results().get(0).unwrap();
    assert!(producer.stdout.is_on_disk(), "5 MiB must spill to disk");
    assert_eq!(producer.stdout.size_bytes(), FIVE_MIB as u64);

    // The consumer received a path, not the payload: its byte count
    // matches the full capture.
    let consumer = engine.results().get(1).unwrap();
    let (text, _) = consumer.stdout.text_for_substitution().unwrap();
    assert!(
        text.contains(&FIVE_MIB.to_string()),
        "wc should count the spilled file, got '{}'",
        text
    );

    // All capture temp files disappear at workflow cleanup.
    assert!(engine.registry().tracked_count() > 0);
    engine.registry().remove_all();
    assert!(fixture.capture_temp_files().is_empty());
}

#[tokio::test]
async fn test_cross_task_stdout_substitution() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=echo\narguments=release-7\n\
         task=1\ncommand=echo\narguments=deploying @0_stdout@\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0);
    let (text, _) = engine
        .results()
        .get(1)
        .unwrap()
        .stdout
        .text_for_substitution()
        .unwrap();
    assert_eq!(text, "deploying release-7");
}

#[tokio::test]
async fn test_reference_to_skipped_task_is_dependency_failure() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=echo\narguments=yes\n\
         task=1\ncommand=echo\narguments=x\ncondition=@0_stdout@=no\n\
         task=2\ncommand=echo\narguments=@1_stdout@\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 21);
    assert!(!outcome.success);
    assert!(!engine.results().contains(2), "task 2 never spawned");
}

#[tokio::test]
async fn test_parallel_retry_failed_reschedules_criterion_failures() {
    let fixture = WorkflowFixture::new();
    let marker = fixture.path().join("flaky.marker");
    // Subtask 10 fails once, then succeeds on the retry.
    let text = format!(
        "task=5\ntype=parallel\ntasks=10\nretry_failed=true\nretry_count=2\n\
         task=9\ntype=return\nreturn=0\n\
         task=10\ncommand=test -f {m} || {{ touch {m}; exit 1; }}\nexec=shell\n",
        m = marker.display()
    );
    let mut engine = fixture.engine(&text);
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let subtask = engine.results().get(10).unwrap();
    assert!(subtask.success);
    assert_eq!(subtask.attempts, 2);
}

#[tokio::test]
async fn test_parallel_timeout_not_retried() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=5\ntype=parallel\ntasks=10\nretry_failed=true\nretry_count=3\nsuccess=any_success\n\
         task=9\ntype=return\nreturn=0\n\
         task=10\ncommand=sleep\narguments=30\ntimeout=1\n",
    );
    let outcome = engine.run().await;

    // The aggregate fails (exit 14): zero successes.
    assert_eq!(outcome.exit_code, 14);
    let subtask = engine.results().get(10).unwrap();
    assert!(subtask.timed_out);
    assert_eq!(subtask.attempts, 1, "timeouts are never retried");
}

#[tokio::test]
async fn test_conditional_branch_sibling_reference() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=echo\narguments=go\n\
         task=1\ntype=conditional\ncondition=@0_stdout@=go\nif_true_tasks=10,11\n\
         task=9\ntype=return\nreturn=0\n\
         task=10\ncommand=echo\narguments=alpha\n\
         task=11\ncommand=echo\narguments=follows @10_stdout@\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let (text, _) = engine
        .results()
        .get(11)
        .unwrap()
        .stdout
        .text_for_substitution()
        .unwrap();
    assert_eq!(text, "follows alpha");
}

#[tokio::test]
async fn test_stdout_split_accessor_flows_between_tasks() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=echo\narguments=web01 10.0.0.7 healthy\nstdout_split=space 1\n\
         task=1\ncommand=echo\narguments=ip=@0_stdout_line_0@\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let (text, _) = engine
        .results()
        .get(1)
        .unwrap()
        .stdout
        .text_for_substitution()
        .unwrap();
    assert_eq!(text, "ip=10.0.0.7");
}

#[tokio::test]
async fn test_env_overrides_expand_variables() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "RELEASE=v2\ntask=0\ncommand=printenv DEPLOY_TAG\nexec=shell\nenv_DEPLOY_TAG=tag-@RELEASE@\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    let (text, _) = engine
        .results()
        .get(0)
        .unwrap()
        .stdout
        .text_for_substitution()
        .unwrap();
    assert_eq!(text, "tag-v2");
}

#[tokio::test]
async fn test_decision_routes_on_recorded_results() {
    let fixture = WorkflowFixture::new();
    let mut engine = fixture.engine(
        "task=0\ncommand=false\nnext=always\n\
         task=1\ntype=decision\nsuccess=@0_exit@=0\non_success=5\non_failure=6\n\
         task=5\ncommand=echo\narguments=healthy\nnext=never\n\
         task=6\ntype=return\nreturn=30\n",
    );
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 30);
    assert!(engine.results().contains(1));
    assert!(!engine.results().contains(5));
}

#[tokio::test]
async fn test_loop_until_success_with_break() {
    let fixture = WorkflowFixture::new();
    let counter = fixture.path().join("count");
    // Succeeds on the third pass.
    let text = format!(
        "task=0\ncommand=echo x >> {c}; test $(wc -l < {c}) -ge 3\nexec=shell\nnext=loop\nloop=5\nloop_break=true\n",
        c = counter.display()
    );
    let mut engine = fixture.engine(&text);
    let outcome = engine.run().await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    assert_eq!(engine.results().execution_path(), &[0, 0, 0]);
    assert!(engine.results().get(0).unwrap().success);
}
