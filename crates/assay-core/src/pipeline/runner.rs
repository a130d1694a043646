use std::sync::Arc;

use serde_json::json;

use crate::cancellation::CancellationToken;
use crate::dispatch::{DispatchRequest, DispatchResult, Dispatcher};
use crate::graph::{TaskGraph, skip_event};
use crate::models::{
    CoreError, CoreErrorKind, Event, EventOutcome, EventType, ExperimentId, PipelineDefinition,
    PipelineRun, PipelineRunState, PipelineStep, RecordedEvent, TaskDefinition, TaskList,
    TaskStatus, TaskTransition,
};
use crate::persistence::RegistryStore;
use crate::pipeline::{PipelineCatalog, execution_order};
use crate::projection::{FAILED_STEP_KEY, HALT_SKIPPED_KEY, NEXT_STEP_KEY, STEPS_KEY};
use crate::skills::Skill;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepReport {
    pub step: String,
    pub skill: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Outcome of one `run` or `resume` call. `steps` lists only the steps this
/// call acted on.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineResult {
    pub experiment: ExperimentId,
    pub pipeline: String,
    pub state: PipelineRunState,
    pub steps: Vec<StepReport>,
    pub failed_step: Option<String>,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
    pub error: Option<CoreError>,
}

impl PipelineResult {
    fn new(experiment: &ExperimentId, pipeline: &str) -> Self {
        Self {
            experiment: experiment.clone(),
            pipeline: pipeline.to_string(),
            state: PipelineRunState::Running,
            steps: Vec::new(),
            failed_step: None,
            exit_code: None,
            stderr_tail: None,
            error: None,
        }
    }

    /// Completed with every required step passing or skipped by an operator.
    pub fn is_success(&self) -> bool {
        self.state == PipelineRunState::Completed && self.error.is_none()
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.step == name)
    }
}

pub struct PipelineRunner {
    dispatcher: Arc<Dispatcher>,
    catalog: PipelineCatalog,
}

impl PipelineRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, catalog: PipelineCatalog) -> Self {
        Self {
            dispatcher,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    fn store(&self) -> &Arc<dyn RegistryStore> {
        self.dispatcher.store()
    }

    fn graph(&self) -> &TaskGraph {
        self.dispatcher.graph()
    }

    /// Starts `pipeline` from its first step. Every step runs, including steps
    /// whose task already passed in an earlier run.
    pub async fn run(
        &self,
        experiment: &ExperimentId,
        pipeline: &str,
        cancel: &CancellationToken,
    ) -> DispatchResult<PipelineResult> {
        let definition = self.catalog.get(pipeline)?;
        let order = execution_order(definition)?;
        self.check_skills(experiment, &order)?;
        self.store().get(experiment)?;

        if let Some(existing) = self.store().pipeline_run(experiment)?
            && !existing.is_finished()
        {
            return Err(CoreError::new(
                CoreErrorKind::ValidationError,
                format!(
                    "pipeline '{}' has an unfinished run ({}); resume it instead",
                    existing.pipeline,
                    existing.state.as_str()
                ),
            )
            .experiment(experiment));
        }

        let definitions = order
            .iter()
            .map(|step| self.task_definition(step))
            .collect::<DispatchResult<Vec<_>>>()?;
        let tasks = self.graph().define_tasks(experiment, definitions)?;
        for step in &order {
            if tasks
                .get(&step.name)
                .is_some_and(|task| task.status == TaskStatus::Skipped)
            {
                self.graph()
                    .requeue(experiment, &step.name, "requeued by a new pipeline run")?;
            }
        }

        let step_names: Vec<&str> = order.iter().map(|step| step.name.as_str()).collect();
        self.store().append_event(
            experiment,
            Event::new(EventType::PipelineStart)
                .pipeline(&definition.name, 0)
                .message(format!("pipeline '{}' started", definition.name))
                .result(STEPS_KEY, json!(step_names)),
        )?;
        tracing::info!(
            experiment = %experiment,
            pipeline = %definition.name,
            steps = order.len(),
            "pipeline started"
        );

        self.execute(experiment, definition, &order, 0, true, cancel)
            .await
    }

    /// Continues the experiment's latest pipeline run at its first incomplete
    /// step. Passing steps are never re-run. With `skip_failed`, the step that
    /// halted the run is marked skipped instead of retried.
    pub async fn resume(
        &self,
        experiment: &ExperimentId,
        skip_failed: bool,
        cancel: &CancellationToken,
    ) -> DispatchResult<PipelineResult> {
        let run = self.store().pipeline_run(experiment)?.ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("experiment '{experiment}' has no pipeline run to resume"),
            )
            .experiment(experiment)
        })?;

        let definition = self.catalog.get(&run.pipeline)?;
        let order = recorded_order(definition, &run)?;

        if run.is_finished() {
            let mut result = PipelineResult::new(experiment, &run.pipeline);
            result.state = PipelineRunState::Completed;
            let unmet = self.unmet_required(experiment, &run.pipeline, &order)?;
            result.error = unmet_failure(experiment, &run.pipeline, &unmet);
            return Ok(result);
        }

        self.check_skills(experiment, &order)?;

        // Reclaims the step that was running when a previous process died.
        let tasks = self.graph().load_task_list(experiment)?;

        let mut next_step = run.next_step;
        if run.state == PipelineRunState::Halted {
            for name in &run.halt_skipped {
                if tasks
                    .get(name)
                    .is_some_and(|task| task.status == TaskStatus::Skipped)
                {
                    self.graph()
                        .requeue(experiment, name, "requeued by pipeline resume")?;
                }
            }

            let failed = run.failed_step.clone();
            let mut event = Event::new(EventType::PipelineResume).pipeline(&run.pipeline, next_step);
            match failed {
                Some(failed) if skip_failed => {
                    let failed_index = run
                        .steps
                        .iter()
                        .position(|name| *name == failed)
                        .unwrap_or(next_step);
                    next_step = failed_index + 1;
                    event = event
                        .message(format!("resumed past failed step '{failed}'"))
                        .task(TaskTransition::new(failed, TaskStatus::Skipped));
                }
                Some(failed) => {
                    event = event.message(format!("resumed; retrying step '{failed}'"));
                }
                None => {
                    event = event.message("resumed");
                }
            }
            self.store()
                .append_event(experiment, event.result(NEXT_STEP_KEY, next_step))?;
        } else {
            self.store().append_event(
                experiment,
                Event::new(EventType::PipelineResume)
                    .pipeline(&run.pipeline, next_step)
                    .message(format!(
                        "resumed {} run at step {}",
                        run.state.as_str(),
                        next_step
                    ))
                    .result(NEXT_STEP_KEY, next_step),
            )?;
        }

        tracing::info!(
            experiment = %experiment,
            pipeline = %run.pipeline,
            next_step,
            skip_failed,
            "pipeline resumed"
        );

        self.execute(experiment, definition, &order, next_step, false, cancel)
            .await
    }

    async fn execute(
        &self,
        experiment: &ExperimentId,
        definition: &PipelineDefinition,
        order: &[&PipelineStep],
        start: usize,
        rerun_passing: bool,
        cancel: &CancellationToken,
    ) -> DispatchResult<PipelineResult> {
        let pipeline = definition.name.as_str();
        let mut result = PipelineResult::new(experiment, pipeline);

        for (index, step) in order.iter().enumerate().skip(start) {
            let tasks = self.graph().load_task_list(experiment)?;
            let task = tasks.get(&step.name).ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("pipeline step '{}' has no task", step.name),
                )
                .experiment(experiment)
                .task(step.name.clone())
            })?;

            match task.status {
                TaskStatus::Passing if !rerun_passing => continue,
                TaskStatus::Skipped => continue,
                _ => {}
            }

            if let Some(blocker) = unmet_dependency(&tasks, step) {
                let reason = format!(
                    "dependency '{}' is {}",
                    blocker.0,
                    blocker.1.as_str()
                );
                self.store().append_event(
                    experiment,
                    skip_event(&step.name, &reason).pipeline(pipeline, index),
                )?;
                tracing::warn!(
                    experiment = %experiment,
                    pipeline,
                    task = %step.name,
                    message = %reason,
                    "pipeline step skipped"
                );
                result.steps.push(StepReport {
                    step: step.name.clone(),
                    skill: step.skill.clone(),
                    status: TaskStatus::Skipped,
                    exit_code: None,
                    message: Some(reason),
                });
                continue;
            }

            let request = DispatchRequest::new(experiment.clone(), &step.skill)
                .args(step.args.iter().cloned())
                .task(&step.name)
                .pipeline(pipeline, index);
            let report = self.dispatcher.dispatch(request, cancel).await?;

            let exit_code = report.exit_code();
            let status = if report.is_success() {
                TaskStatus::Passing
            } else if report.event.outcome == Some(EventOutcome::Cancelled) {
                TaskStatus::Pending
            } else {
                TaskStatus::Failing
            };
            result.steps.push(StepReport {
                step: step.name.clone(),
                skill: step.skill.clone(),
                status,
                exit_code,
                message: report.event.message.clone(),
            });

            let Some(failure) = report.failure else {
                continue;
            };

            if failure.kind == CoreErrorKind::Cancelled {
                tracing::warn!(
                    experiment = %experiment,
                    pipeline,
                    task = %step.name,
                    "pipeline interrupted"
                );
                result.state = PipelineRunState::Interrupted;
                result.failed_step = Some(step.name.clone());
                result.error = Some(failure);
                return Ok(result);
            }

            if !step.required {
                tracing::warn!(
                    experiment = %experiment,
                    pipeline,
                    task = %step.name,
                    kind = ?failure.kind,
                    message = %failure.message,
                    "optional pipeline step failed; continuing"
                );
                continue;
            }

            self.halt(experiment, pipeline, order, index, &failure, exit_code)?;
            result.state = PipelineRunState::Halted;
            result.failed_step = Some(step.name.clone());
            result.exit_code = exit_code;
            result.stderr_tail = report.stderr_tail;
            result.error = Some(failure);
            return Ok(result);
        }

        let unmet = self.unmet_required(experiment, pipeline, order)?;
        let failure = unmet_failure(experiment, pipeline, &unmet);
        let (outcome, message) = match &failure {
            None => (
                EventOutcome::Succeeded,
                format!("pipeline '{pipeline}' completed"),
            ),
            Some(error) => (EventOutcome::Failed, error.message.clone()),
        };

        self.store().append_event(
            experiment,
            Event::new(EventType::PipelineComplete)
                .pipeline(pipeline, order.len())
                .outcome(outcome)
                .message(message),
        )?;
        tracing::info!(experiment = %experiment, pipeline, ?outcome, "pipeline completed");

        result.state = PipelineRunState::Completed;
        result.error = failure;
        Ok(result)
    }

    /// Records the halt first, then skips the steps that never started. A crash
    /// between the two leaves a halted run whose resume requeues only what was
    /// actually skipped.
    fn halt(
        &self,
        experiment: &ExperimentId,
        pipeline: &str,
        order: &[&PipelineStep],
        failed_index: usize,
        failure: &CoreError,
        exit_code: Option<i32>,
    ) -> DispatchResult<()> {
        let failed_step = order[failed_index].name.as_str();
        let tasks = self.store().task_list(experiment)?;
        let to_skip: Vec<&str> = order[failed_index + 1..]
            .iter()
            .filter(|step| {
                tasks
                    .get(&step.name)
                    .is_some_and(|task| task.status == TaskStatus::Pending)
            })
            .map(|step| step.name.as_str())
            .collect();

        let mut halted = Event::new(EventType::PipelineHalted)
            .pipeline(pipeline, failed_index)
            .outcome(EventOutcome::Failed)
            .message(format!(
                "pipeline '{pipeline}' halted at step '{failed_step}': {}",
                failure.message
            ))
            .result(FAILED_STEP_KEY, failed_step)
            .result(HALT_SKIPPED_KEY, json!(to_skip))
            .result(NEXT_STEP_KEY, failed_index);
        halted.exit_code = exit_code;
        self.store().append_event(experiment, halted)?;

        for name in &to_skip {
            self.graph().mark_skipped(
                experiment,
                name,
                &format!("pipeline '{pipeline}' halted at step '{failed_step}'"),
            )?;
        }

        tracing::error!(
            experiment = %experiment,
            pipeline,
            task = failed_step,
            exit_code = ?exit_code,
            kind = ?failure.kind,
            message = %failure.message,
            skipped = to_skip.len(),
            "pipeline halted"
        );
        Ok(())
    }

    /// Required steps that did not pass. A skipped step counts as resolved only
    /// when an operator or a `skip_failed` resume skipped it; the runner's own
    /// skips for an unmet dependency leave the step unmet.
    fn unmet_required(
        &self,
        experiment: &ExperimentId,
        pipeline: &str,
        order: &[&PipelineStep],
    ) -> DispatchResult<Vec<String>> {
        let tasks = self.store().task_list(experiment)?;
        let events = self.store().events(experiment)?;
        Ok(order
            .iter()
            .filter(|step| step.required)
            .filter(|step| match tasks.get(&step.name).map(|task| task.status) {
                Some(TaskStatus::Passing) => false,
                Some(TaskStatus::Skipped) => skipped_by_runner(&events, pipeline, &step.name),
                _ => true,
            })
            .map(|step| step.name.clone())
            .collect())
    }

    fn check_skills(&self, experiment: &ExperimentId, order: &[&PipelineStep]) -> DispatchResult<()> {
        for step in order {
            self.dispatcher
                .skills()
                .resolve(&step.skill)
                .map_err(|error| error.experiment(experiment).task(step.name.clone()))?;
        }
        Ok(())
    }

    fn task_definition(&self, step: &PipelineStep) -> DispatchResult<TaskDefinition> {
        let skill = self.dispatcher.skills().resolve(&step.skill)?;
        let mut definition = TaskDefinition::new(step.name.clone()).stage(skill.stage());
        definition.dependencies = step.depends_on.clone();
        Ok(definition)
    }
}

/// The run's persisted step order, mapped back onto the definition.
fn recorded_order<'a>(
    definition: &'a PipelineDefinition,
    run: &PipelineRun,
) -> DispatchResult<Vec<&'a PipelineStep>> {
    if run.steps.is_empty() {
        return execution_order(definition);
    }
    run.steps
        .iter()
        .map(|name| {
            definition.get(name).ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::ValidationError,
                    format!(
                        "pipeline '{}' no longer defines step '{name}' recorded by its run",
                        definition.name
                    ),
                )
            })
        })
        .collect()
}

fn unmet_failure(experiment: &ExperimentId, pipeline: &str, unmet: &[String]) -> Option<CoreError> {
    (!unmet.is_empty()).then(|| {
        CoreError::new(
            CoreErrorKind::ExecutionFailure,
            format!(
                "pipeline '{pipeline}' completed without passing required step(s): {}",
                unmet.join(", ")
            ),
        )
        .experiment(experiment)
    })
}

/// Whether the latest skip of `task` is the runner's dependency skip, the
/// only `task_skipped` event that carries this pipeline's step mark.
fn skipped_by_runner(events: &[RecordedEvent], pipeline: &str, task: &str) -> bool {
    events
        .iter()
        .rev()
        .map(|recorded| &recorded.event)
        .find(|event| {
            event
                .task
                .as_ref()
                .is_some_and(|transition| transition.name == task && transition.to == TaskStatus::Skipped)
        })
        .is_some_and(|event| {
            event.event_type == EventType::TaskSkipped
                && event
                    .pipeline
                    .as_ref()
                    .is_some_and(|mark| mark.pipeline == pipeline)
        })
}

fn unmet_dependency<'a>(tasks: &'a TaskList, step: &'a PipelineStep) -> Option<(&'a str, TaskStatus)> {
    step.depends_on.iter().find_map(|dependency| {
        let status = tasks
            .get(dependency)
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Pending);
        (status != TaskStatus::Passing).then_some((dependency.as_str(), status))
    })
}
