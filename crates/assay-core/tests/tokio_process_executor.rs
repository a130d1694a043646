#![cfg(unix)]

use std::time::Duration;

use assay_core::execution::{
    CommandSpec, MAX_CAPTURED_BYTES, ProcessExitStatus, ProcessSpawnRequest,
    ProcessTerminationMode, TokioProcessExecutor, signal_process_group, spawn_validated,
};
use assay_core::models::{CoreErrorKind, ExperimentId};

fn shell(script: &str) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new("qc", CommandSpec::new("/bin/sh").arg("-c").arg(script))
        .experiment(ExperimentId::new("exp-exec"))
        .task("qc")
}

#[tokio::test]
async fn captures_stdout_and_stderr_separately() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("echo out; echo err >&2"))
        .expect("spawn should succeed");

    assert!(handle.pid().is_some());

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
    assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    assert!(output.started_at <= output.finished_at);
}

#[tokio::test]
async fn captures_nonzero_exit_code() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("exit 3")).expect("spawn should succeed");
    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(3));
}

#[tokio::test]
async fn timeout_kills_the_process_group() {
    let executor = TokioProcessExecutor;
    let request = shell("sleep 30 & sleep 30").timeout(Duration::from_millis(150));

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("timed-out process must not hang the caller")
        .expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::TimedOut);
}

#[tokio::test]
async fn immediate_signal_kills_the_process_group() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("sleep 30")).expect("spawn should succeed");

    let pid = handle.pid().expect("spawned process has a pid");
    signal_process_group(pid, ProcessTerminationMode::Immediate).expect("signal should succeed");

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn timeout_sends_sigterm_before_killing() {
    let executor = TokioProcessExecutor;
    let request = shell("trap 'echo cleaned up; exit 0' TERM; sleep 30 & wait")
        .timeout(Duration::from_millis(200))
        .grace_period(Duration::from_secs(3));

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("graceful shutdown must not hang the caller")
        .expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::TimedOut);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "cleaned up");
}

#[tokio::test]
async fn timeout_kills_a_process_that_ignores_sigterm() {
    let executor = TokioProcessExecutor;
    let request = shell("trap '' TERM; while :; do sleep 1; done")
        .timeout(Duration::from_millis(150))
        .grace_period(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("ignored SIGTERM must still end in a kill")
        .expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(450));
}

#[tokio::test]
async fn output_is_kept_when_a_descendant_holds_the_pipe_open() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(
        &executor,
        shell(r#"echo '{"status":"ok"}'; sleep 5 &"#),
    )
    .expect("spawn should succeed");

    let started = std::time::Instant::now();
    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        r#"{"status":"ok"}"#
    );
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn captured_output_keeps_the_tail_within_the_limit() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("head -c 9000000 /dev/zero; echo done"))
        .expect("spawn should succeed");

    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert!(output.stdout.len() <= MAX_CAPTURED_BYTES);
    assert!(output.stdout.ends_with(b"done\n"));
}

#[tokio::test]
async fn spawn_nonexistent_program_is_an_execution_failure() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new("align", CommandSpec::new("/nonexistent/assay-align"))
        .experiment(ExperimentId::new("exp-missing"))
        .task("align");

    let error = match spawn_validated(&executor, request) {
        Err(error) => error,
        Ok(_) => panic!("expected spawn to fail for a nonexistent binary"),
    };

    assert_eq!(error.kind, CoreErrorKind::ExecutionFailure);
    assert_eq!(error.experiment, Some(ExperimentId::new("exp-missing")));
    assert_eq!(error.skill.as_deref(), Some("align"));
    assert_eq!(error.task.as_deref(), Some("align"));
}

#[tokio::test]
async fn env_vars_are_passed_to_child() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new(
        "qc",
        CommandSpec::new("/usr/bin/env").env("ASSAY_TEST_VAR", "test_value_42"),
    );

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("ASSAY_TEST_VAR=test_value_42"),
        "expected env var in output, got: {stdout}"
    );
}

#[tokio::test]
async fn empty_program_is_rejected_before_spawn() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new("qc", CommandSpec::new(""));

    let error = match spawn_validated(&executor, request) {
        Err(error) => error,
        Ok(_) => panic!("expected an empty program to be rejected"),
    };
    assert_eq!(error.kind, CoreErrorKind::ValidationError);
}
