//! Runs one skill against one experiment and records the outcome.
//!
//! Per invocation: check the experiment, resolve the skill, mark its task
//! `in_progress`, run the subprocess, checksum declared outputs, parse the
//! trailing JSON line, then append a single `analysis` event that also carries
//! the task verdict.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::config::{AssayConfig, DEFAULT_TAIL_BYTES};
use crate::execution::{
    ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, TokioProcessExecutor, signal_process_group, spawn_validated,
    tail_text,
};
use crate::graph::{StalePolicy, TaskGraph, TaskResolution};
use crate::models::{
    CoreError, CoreErrorKind, Event, EventId, EventOutcome, EventType, ExperimentId,
    OutputArtifact, PipelineMark, TIMEOUT_EXIT_CODE, TaskDefinition, TaskStatus,
};
use crate::persistence::{AppendOutcome, RegistryStore};
use crate::provenance::{capture_hpc_context, checksum_artifact};
use crate::skills::{Skill, SkillSet};

pub type DispatchResult<T> = Result<T, CoreError>;

pub const STDERR_TAIL_KEY: &str = "stderr_tail";
pub const STDOUT_TAIL_KEY: &str = "stdout_tail";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchRequest {
    pub experiment: ExperimentId,
    pub skill: String,
    pub args: Vec<String>,
    /// Task that owns the run; defaults to the skill name.
    pub task: Option<String>,
    pub timeout: Option<Duration>,
    pub pipeline: Option<PipelineMark>,
}

impl DispatchRequest {
    pub fn new(experiment: ExperimentId, skill: impl Into<String>) -> Self {
        Self {
            experiment,
            skill: skill.into(),
            args: Vec::new(),
            task: None,
            timeout: None,
            pipeline: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pipeline(mut self, pipeline: impl Into<String>, step_index: usize) -> Self {
        self.pipeline = Some(PipelineMark {
            pipeline: pipeline.into(),
            step_index,
        });
        self
    }

    fn task_name(&self) -> &str {
        self.task.as_deref().unwrap_or(&self.skill)
    }
}

/// What one dispatch recorded. A failed skill run is still a completed
/// dispatch: `failure` says why the event is not a success.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchReport {
    pub event: Event,
    pub append: AppendOutcome,
    pub task: String,
    pub attempt: u32,
    pub failure: Option<CoreError>,
    pub stderr_tail: Option<String>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.event.exit_code
    }

    pub fn into_result(self) -> DispatchResult<Event> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.event),
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn RegistryStore>,
    graph: TaskGraph,
    skills: SkillSet,
    executor: Arc<dyn ProcessExecutor>,
    tail_bytes: usize,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RegistryStore>, skills: SkillSet) -> Self {
        Self {
            graph: TaskGraph::new(store.clone()),
            store,
            skills,
            executor: Arc::new(TokioProcessExecutor),
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    pub fn from_config(
        store: Arc<dyn RegistryStore>,
        config: &AssayConfig,
    ) -> DispatchResult<Self> {
        let skills = SkillSet::from_config(config)?;
        Ok(Self::new(store, skills)
            .with_stale_policy(StalePolicy {
                stale_after: config.stale_after(),
            })
            .with_tail_bytes(config.tail_bytes))
    }

    pub fn with_executor(mut self, executor: Arc<dyn ProcessExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.graph = self.graph.with_stale_policy(policy);
        self
    }

    pub fn with_tail_bytes(mut self, tail_bytes: usize) -> Self {
        self.tail_bytes = tail_bytes.max(1);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn skills(&self) -> &SkillSet {
        &self.skills
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Runs `skill` and returns its event, or the error that made the run
    /// unsuccessful (after the run has been recorded).
    pub async fn run(
        &self,
        experiment: &ExperimentId,
        skill: &str,
        args: &[String],
    ) -> DispatchResult<Event> {
        let request = DispatchRequest::new(experiment.clone(), skill).args(args.iter().cloned());
        self.dispatch(request, &CancellationToken::new())
            .await?
            .into_result()
    }

    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: &CancellationToken,
    ) -> DispatchResult<DispatchReport> {
        let experiment_id = &request.experiment;
        let experiment = self.store.get(experiment_id)?;
        let skill = self
            .skills
            .resolve(&request.skill)
            .map_err(|error| error.experiment(experiment_id))?;
        let invocation = skill.invocation(&experiment, &request.args)?;
        let task_name = request.task_name().to_string();

        if cancel.is_cancelled() {
            return Err(CoreError::new(
                CoreErrorKind::Cancelled,
                "dispatch cancelled before the skill started",
            )
            .experiment(experiment_id)
            .skill(skill.name())
            .task(task_name));
        }

        let tasks = self.graph.load_task_list(experiment_id)?;
        if !tasks.contains(&task_name) {
            self.graph.define_tasks(
                experiment_id,
                vec![TaskDefinition::new(task_name.clone()).stage(skill.stage())],
            )?;
        } else if let Some(task) = tasks.get(&task_name)
            && task.status == TaskStatus::InProgress
        {
            return Err(CoreError::new(
                CoreErrorKind::ValidationError,
                format!("task '{task_name}' already has an attempt in progress"),
            )
            .experiment(experiment_id)
            .skill(skill.name())
            .task(task_name));
        }

        let started = self
            .graph
            .mark_started(experiment_id, &task_name)
            .map_err(|error| error.attribute(None, Some(skill.name()), None))?;
        let attempt = started.attempts;

        let timeout = request.timeout.unwrap_or(invocation.timeout);
        let command_line = invocation.command.display_line();
        let spawn_request = ProcessSpawnRequest::new(skill.name(), invocation.command)
            .experiment(experiment_id.clone())
            .task(task_name.clone())
            .timeout(timeout);

        tracing::info!(
            experiment = %experiment_id,
            skill = skill.name(),
            task = %task_name,
            attempt,
            command = %command_line,
            "dispatching skill"
        );

        let run = self.execute(spawn_request, cancel).await;
        let verdict = match run {
            Ok((output, cancelled)) => self.judge(
                skill.as_ref(),
                &output,
                cancelled,
                timeout,
                &invocation.declared_outputs,
            ),
            Err(error) => Verdict::spawn_failure(error),
        };

        let mut event = Event::new(EventType::Analysis)
            .with_id(EventId::derive(&[
                experiment_id.as_str(),
                &task_name,
                &attempt.to_string(),
                "result",
            ]))
            .skill(skill.name())
            .command(command_line)
            .stage(Some(skill.stage().to_string()))
            .outcome(verdict.outcome)
            .message(verdict.message.clone());
        event.exit_code = verdict.exit_code;
        event.duration_ms = verdict.duration_ms;
        event.outputs = verdict.outputs;
        event.results = verdict.results;
        event.hpc = capture_hpc_context();
        event.pipeline = request.pipeline.clone();

        let append = self
            .graph
            .record_result(experiment_id, &task_name, verdict.resolution, event.clone())
            .map_err(|error| error.attribute(None, Some(skill.name()), None))?;

        let failure = verdict.failure.map(|error| {
            error.attribute(Some(experiment_id), Some(skill.name()), Some(&task_name))
        });
        match &failure {
            None => tracing::info!(
                experiment = %experiment_id,
                skill = skill.name(),
                task = %task_name,
                duration_ms = ?event.duration_ms,
                "skill succeeded"
            ),
            Some(error) => tracing::error!(
                experiment = %experiment_id,
                skill = skill.name(),
                task = %task_name,
                exit_code = ?event.exit_code,
                kind = ?error.kind,
                message = %error.message,
                "skill failed"
            ),
        }

        Ok(DispatchReport {
            event,
            append,
            task: task_name,
            attempt,
            failure,
            stderr_tail: verdict.stderr_tail,
        })
    }

    async fn execute(
        &self,
        spawn_request: ProcessSpawnRequest,
        cancel: &CancellationToken,
    ) -> DispatchResult<(ProcessOutput, bool)> {
        let process = spawn_validated(self.executor.as_ref(), spawn_request)?;
        let pid = process.pid();
        let mut wait = process.wait();

        tokio::select! {
            output = &mut wait => Ok((output?, false)),
            _ = cancel.cancelled() => {
                if let Some(pid) = pid
                    && let Err(error) = signal_process_group(pid, ProcessTerminationMode::Immediate)
                {
                    tracing::warn!(pid, message = %error.message, "failed to kill cancelled skill");
                }
                Ok((wait.await?, true))
            }
        }
    }

    fn judge(
        &self,
        skill: &dyn Skill,
        output: &ProcessOutput,
        cancelled: bool,
        timeout: Duration,
        declared_outputs: &[PathBuf],
    ) -> Verdict {
        let stderr_tail = tail_text(&output.stderr, self.tail_bytes);
        let stdout_tail = tail_text(&output.stdout, self.tail_bytes);
        let duration_ms = u64::try_from(output.duration().as_millis()).ok();
        let diagnostics = |description: String| {
            stderr_tail
                .clone()
                .map(|tail| format!("{description}: {tail}"))
                .unwrap_or(description)
        };

        let mut verdict = Verdict {
            outcome: EventOutcome::Failed,
            resolution: TaskResolution::Failing,
            exit_code: None,
            duration_ms,
            outputs: Vec::new(),
            results: BTreeMap::new(),
            message: String::new(),
            failure: None,
            stderr_tail: stderr_tail.clone(),
        };

        let failed = |verdict: &mut Verdict, kind: CoreErrorKind, description: String| {
            if let Some(tail) = &stderr_tail {
                verdict
                    .results
                    .insert(STDERR_TAIL_KEY.to_string(), Value::from(tail.clone()));
            }
            if let Some(tail) = &stdout_tail {
                verdict
                    .results
                    .insert(STDOUT_TAIL_KEY.to_string(), Value::from(tail.clone()));
            }
            let message = diagnostics(description);
            verdict.message = message.clone();
            verdict.failure = Some(CoreError::new(kind, message));
        };

        if cancelled {
            verdict.outcome = EventOutcome::Cancelled;
            verdict.resolution = TaskResolution::Released;
            if let ProcessExitStatus::ExitCode(code) = output.status {
                verdict.exit_code = Some(code);
            }
            failed(
                &mut verdict,
                CoreErrorKind::Cancelled,
                format!("skill '{}' was cancelled", skill.name()),
            );
            return verdict;
        }

        match output.status {
            ProcessExitStatus::TimedOut => {
                verdict.outcome = EventOutcome::TimedOut;
                verdict.exit_code = Some(TIMEOUT_EXIT_CODE);
                failed(
                    &mut verdict,
                    CoreErrorKind::Timeout,
                    format!(
                        "skill '{}' timed out after {}s",
                        skill.name(),
                        timeout.as_secs_f64()
                    ),
                );
            }
            ProcessExitStatus::Terminated => failed(
                &mut verdict,
                CoreErrorKind::ExecutionFailure,
                format!("skill '{}' was terminated by a signal", skill.name()),
            ),
            ProcessExitStatus::ExitCode(code) if code != 0 => {
                verdict.exit_code = Some(code);
                failed(
                    &mut verdict,
                    CoreErrorKind::ExecutionFailure,
                    format!("skill '{}' exited with code {code}", skill.name()),
                );
            }
            ProcessExitStatus::ExitCode(code) => {
                verdict.exit_code = Some(code);

                let mut artifacts = Vec::with_capacity(declared_outputs.len());
                for path in declared_outputs {
                    match checksum_artifact(path) {
                        Ok(artifact) => artifacts.push(artifact),
                        Err(error) => {
                            verdict.outcome = EventOutcome::ProvenanceFailed;
                            failed(
                                &mut verdict,
                                CoreErrorKind::ProvenanceFailure,
                                format!(
                                    "declared output '{}' is missing or unreadable: {error}",
                                    path.display()
                                ),
                            );
                            verdict.outputs = artifacts;
                            return verdict;
                        }
                    }
                }
                verdict.outputs = artifacts;

                match skill.parse_result(&output.stdout) {
                    Ok(results) => {
                        verdict.outcome = EventOutcome::Succeeded;
                        verdict.resolution = TaskResolution::Passing;
                        verdict.results = results;
                        verdict.message = format!(
                            "{} succeeded in {:.1}s",
                            skill.name(),
                            output.duration().as_secs_f64()
                        );
                    }
                    Err(error) => {
                        failed(&mut verdict, CoreErrorKind::ParseFailure, error.message)
                    }
                }
            }
        }

        verdict
    }
}

struct Verdict {
    outcome: EventOutcome,
    resolution: TaskResolution,
    exit_code: Option<i32>,
    duration_ms: Option<u64>,
    outputs: Vec<OutputArtifact>,
    results: BTreeMap<String, Value>,
    message: String,
    failure: Option<CoreError>,
    stderr_tail: Option<String>,
}

impl Verdict {
    fn spawn_failure(error: CoreError) -> Self {
        Self {
            outcome: EventOutcome::Failed,
            resolution: TaskResolution::Failing,
            exit_code: None,
            duration_ms: None,
            outputs: Vec::new(),
            results: BTreeMap::new(),
            message: error.message.clone(),
            failure: Some(error),
            stderr_tail: None,
        }
    }
}
