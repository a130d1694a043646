use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, ExperimentId};

const OUTPUT_READ_WINDOW: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8 * 1024;

/// Per-stream capture limit. Older bytes are dropped first, so the tail that
/// carries a skill's result line survives.
pub const MAX_CAPTURED_BYTES: usize = 4 * 1024 * 1024;

type CaptureBuffer = Arc<Mutex<Vec<u8>>>;

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|error| {
            request.attribute(CoreError::new(
                CoreErrorKind::ExecutionFailure,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            ))
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();

        tracing::debug!(
            experiment = ?request.experiment,
            skill = %request.skill,
            pid = ?pid,
            command = %request.command.display_line(),
            "spawned skill process"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at,
            timeout: request.timeout,
            grace_period: request.grace_period,
            experiment: request.experiment,
            skill: request.skill,
            task: request.task,
        }))
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    grace_period: Duration,
    experiment: Option<ExperimentId>,
    skill: String,
    task: Option<String>,
}

impl TokioRunningProcess {
    fn failure(&self, message: String) -> CoreError {
        CoreError::new(CoreErrorKind::ExecutionFailure, message).attribute(
            self.experiment.as_ref(),
            Some(self.skill.as_str()),
            self.task.as_deref(),
        )
    }
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let child = self.child.lock().ok().and_then(|mut slot| slot.take());
        let consumed_error = self.failure("child process already consumed".to_string());
        let timeout = self.timeout;
        let grace_period = self.grace_period;
        let started_at = self.started_at;
        let pid = self.pid;
        let this = *self;

        Box::pin(async move {
            let mut child = child.ok_or(consumed_error)?;

            let stdout_reader = spawn_reader(child.stdout.take());
            let stderr_reader = spawn_reader(child.stderr.take());

            // Wait for process exit first, then collect output with a short bounded read window.
            // Descendants that inherit stdout/stderr would otherwise keep the readers open.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result
                        .map_err(|error| this.failure(format!("failed to wait for process: {error}")))?
                        .code()
                        .map_or(ProcessExitStatus::Terminated, ProcessExitStatus::ExitCode),
                    Err(_) => {
                        tracing::warn!(
                            experiment = ?this.experiment,
                            skill = %this.skill,
                            timeout_ms = timeout_duration.as_millis() as u64,
                            grace_ms = grace_period.as_millis() as u64,
                            "skill process timed out; terminating its process group"
                        );
                        if let Some(pid) = pid {
                            let _ = signal_process_group(
                                pid,
                                ProcessTerminationMode::Graceful { grace_period },
                            );
                        }
                        let exited = tokio::time::timeout(grace_period, child.wait()).await.is_ok();
                        // Descendants may still hold the group open after the leader exits.
                        if let Some(pid) = pid {
                            let _ = signal_process_group(pid, ProcessTerminationMode::Immediate);
                        }
                        if !exited {
                            tracing::warn!(
                                experiment = ?this.experiment,
                                skill = %this.skill,
                                "skill process ignored SIGTERM and was killed"
                            );
                            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        }
                        ProcessExitStatus::TimedOut
                    }
                }
            } else {
                child
                    .wait()
                    .await
                    .map_err(|error| this.failure(format!("failed to wait for process: {error}")))?
                    .code()
                    .map_or(ProcessExitStatus::Terminated, ProcessExitStatus::ExitCode)
            };

            let stdout = collect(stdout_reader).await;
            let stderr = collect(stderr_reader).await;

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

fn spawn_reader<R>(handle: Option<R>) -> (CaptureBuffer, JoinHandle<()>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buffer = CaptureBuffer::default();
    let sink = buffer.clone();
    let reader = tokio::spawn(async move {
        let Some(mut handle) = handle else {
            return;
        };
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            match handle.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    captured.extend_from_slice(&chunk[..read]);
                    if captured.len() > 2 * MAX_CAPTURED_BYTES {
                        let excess = captured.len() - MAX_CAPTURED_BYTES;
                        captured.drain(..excess);
                    }
                }
            }
        }
    });
    (buffer, reader)
}

/// Waits briefly for the reader to hit EOF, then takes whatever it captured.
/// A descendant still holding the pipe only costs the window, not the output.
async fn collect((buffer, reader): (CaptureBuffer, JoinHandle<()>)) -> Vec<u8> {
    let abort = reader.abort_handle();
    if tokio::time::timeout(OUTPUT_READ_WINDOW, reader).await.is_err() {
        abort.abort();
    }
    let mut captured = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
    if captured.len() > MAX_CAPTURED_BYTES {
        captured.drain(..captured.len() - MAX_CAPTURED_BYTES);
    }
    captured
}

/// Sends a termination signal to the process group led by `pid`.
pub fn signal_process_group(pid: u32, mode: ProcessTerminationMode) -> ExecutionResult<()> {
    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(CoreError::new(
                CoreErrorKind::ExecutionFailure,
                format!("failed to send signal {signal} to process group {pid}: {os_error}"),
            ));
        }
    }

    Ok(())
}
