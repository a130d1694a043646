//! Pure folds from an experiment's event log to its derived state.
//!
//! The store applies these same functions inside the append transaction, so
//! a replay of the log from empty always reproduces what is stored.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::models::{
    CoreError, CoreErrorKind, Event, EventOutcome, EventType, ExperimentStatus, PipelineRun,
    PipelineRunState, Task, TaskDefinition, TaskList, TaskStatus,
};

/// Results key under which `tasks_defined` events carry their definitions.
pub const TASKS_KEY: &str = "tasks";
/// Results key under which `pipeline_start` events carry the step order.
pub const STEPS_KEY: &str = "steps";
pub const NEXT_STEP_KEY: &str = "next_step";
pub const FAILED_STEP_KEY: &str = "failed_step";
pub const HALT_SKIPPED_KEY: &str = "halt_skipped";

pub type ProjectionResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentProjection {
    pub status: ExperimentStatus,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl Default for ExperimentProjection {
    fn default() -> Self {
        Self {
            status: ExperimentStatus::Discovered,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl ExperimentProjection {
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event);
        }
        projection
    }

    pub fn apply(&mut self, event: &Event) {
        self.tags.extend(event.tags.iter().cloned());
        let archived = self.status == ExperimentStatus::Archived;

        match event.event_type {
            EventType::Discovered | EventType::Note => self.merge_metadata(&event.results),
            EventType::Registered => {
                if self.status == ExperimentStatus::Discovered {
                    self.status = ExperimentStatus::Registered;
                }
                self.merge_metadata(&event.results);
            }
            EventType::Analysis if event.is_success() => {
                if !archived {
                    self.raise_to(ExperimentStatus::Analyzing);
                    if event.stage.as_deref() == Some("qc") {
                        self.raise_to(ExperimentStatus::QcComplete);
                    }
                }
                if let Some(skill) = &event.skill
                    && !event.results.is_empty()
                {
                    let results = event
                        .results
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    self.metadata.insert(skill.clone(), Value::Object(results));
                }
            }
            EventType::StatusChange => {
                if let Some(status) = event.status {
                    self.status = status;
                }
            }
            EventType::PipelineStart => {
                if !archived {
                    self.raise_to(ExperimentStatus::Analyzing);
                }
            }
            EventType::PipelineComplete => {
                if !archived && event.is_success() {
                    self.raise_to(ExperimentStatus::Analyzed);
                }
            }
            _ => {}
        }
    }

    fn raise_to(&mut self, status: ExperimentStatus) {
        if self.status < status {
            self.status = status;
        }
    }

    fn merge_metadata(&mut self, results: &BTreeMap<String, Value>) {
        for (key, value) in results {
            self.metadata.insert(key.clone(), value.clone());
        }
    }
}

pub fn replay_task_list<'a>(
    events: impl IntoIterator<Item = &'a Event>,
) -> ProjectionResult<TaskList> {
    let mut list = TaskList::default();
    for event in events {
        apply_task_event(&mut list, event)?;
    }
    Ok(list)
}

/// Applies the task-related part of `event` to `list`. Rejects transitions
/// the task state machine does not allow.
pub fn apply_task_event(list: &mut TaskList, event: &Event) -> ProjectionResult<()> {
    if event.event_type == EventType::TasksDefined {
        for definition in task_definitions(event)? {
            merge_definition(list, definition);
        }
    }

    let Some(transition) = &event.task else {
        return Ok(());
    };

    let task = list.get_mut(&transition.name).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::NotFound,
            format!("task '{}' is not defined for this experiment", transition.name),
        )
        .task(transition.name.clone())
    })?;

    if !task.status.can_transition_to(transition.to) {
        return Err(CoreError::new(
            CoreErrorKind::InvalidTransition,
            format!(
                "task '{}' cannot transition from '{}' to '{}'",
                task.name,
                task.status.as_str(),
                transition.to.as_str()
            ),
        )
        .task(task.name.clone()));
    }

    match transition.to {
        TaskStatus::InProgress => {
            task.attempts = task.attempts.saturating_add(1);
            task.owner = transition.owner.clone();
            task.started_at_ms = Some(event.timestamp_ms);
        }
        TaskStatus::Passing => {
            task.error = None;
            task.owner = None;
        }
        TaskStatus::Failing => {
            task.error = Some(
                event
                    .message
                    .clone()
                    .unwrap_or_else(|| "task failed without diagnostic output".to_string()),
            );
            task.owner = None;
        }
        TaskStatus::Pending | TaskStatus::Skipped => {
            task.owner = None;
        }
    }
    task.status = transition.to;

    Ok(())
}

pub fn task_definitions(event: &Event) -> ProjectionResult<Vec<TaskDefinition>> {
    let Some(raw) = event.results.get(TASKS_KEY) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw.clone()).map_err(|error| {
        CoreError::new(
            CoreErrorKind::ValidationError,
            format!("event '{}' carries malformed task definitions: {error}", event.id),
        )
    })
}

fn merge_definition(list: &mut TaskList, definition: TaskDefinition) {
    match list.get_mut(&definition.name) {
        Some(existing) => {
            existing.pipeline_stage = definition.pipeline_stage.or(existing.pipeline_stage.take());
            existing.dependencies = definition.dependencies;
            existing.priority = definition.priority.or(existing.priority);
        }
        None => list.tasks.push(Task::from_definition(definition)),
    }
}

pub fn replay_pipeline_run<'a>(events: impl IntoIterator<Item = &'a Event>) -> Option<PipelineRun> {
    let mut run = None;
    for event in events {
        apply_pipeline_event(&mut run, event);
    }
    run
}

pub fn apply_pipeline_event(run: &mut Option<PipelineRun>, event: &Event) {
    if event.event_type == EventType::PipelineStart {
        let Some(mark) = &event.pipeline else {
            return;
        };
        *run = Some(PipelineRun {
            pipeline: mark.pipeline.clone(),
            steps: string_list(event.results.get(STEPS_KEY)),
            next_step: 0,
            state: PipelineRunState::Running,
            failed_step: None,
            halt_skipped: Vec::new(),
            started_at_ms: event.timestamp_ms,
            updated_at_ms: event.timestamp_ms,
        });
        return;
    }

    let Some(current) = run.as_mut() else {
        return;
    };
    if let Some(mark) = &event.pipeline
        && mark.pipeline != current.pipeline
    {
        return;
    }

    match event.event_type {
        EventType::Analysis => {
            let Some(mark) = &event.pipeline else {
                return;
            };
            // A failed step stays the resume point until a later step passes
            // or a halt records where to continue.
            if event.outcome == Some(EventOutcome::Cancelled) {
                current.state = PipelineRunState::Interrupted;
            } else if event.is_success() {
                current.next_step = current.next_step.max(mark.step_index + 1);
            }
        }
        EventType::TaskSkipped => {
            let Some(mark) = &event.pipeline else {
                return;
            };
            current.next_step = current.next_step.max(mark.step_index + 1);
        }
        EventType::PipelineHalted => {
            current.state = PipelineRunState::Halted;
            current.failed_step = event
                .results
                .get(FAILED_STEP_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            current.halt_skipped = string_list(event.results.get(HALT_SKIPPED_KEY));
            if let Some(next) = next_step(event) {
                current.next_step = next;
            }
        }
        EventType::PipelineResume => {
            current.state = PipelineRunState::Running;
            current.failed_step = None;
            current.halt_skipped.clear();
            if let Some(next) = next_step(event) {
                current.next_step = next;
            }
        }
        EventType::PipelineComplete => {
            current.state = PipelineRunState::Completed;
            current.next_step = current.steps.len();
        }
        _ => return,
    }
    current.updated_at_ms = event.timestamp_ms;
}

fn next_step(event: &Event) -> Option<usize> {
    event
        .results
        .get(NEXT_STEP_KEY)
        .and_then(Value::as_u64)
        .and_then(|value| usize::try_from(value).ok())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ExperimentProjection, STEPS_KEY, TASKS_KEY, apply_task_event, replay_pipeline_run,
        replay_task_list,
    };
    use crate::models::{
        CoreErrorKind, Event, EventOutcome, EventType, ExperimentStatus, TaskDefinition,
        TaskList, TaskStatus, TaskTransition,
    };

    fn defined(tasks: &[TaskDefinition]) -> Event {
        Event::new(EventType::TasksDefined).result(TASKS_KEY, json!(tasks))
    }

    #[test]
    fn qc_analysis_moves_experiment_to_qc_complete() {
        let events = vec![
            Event::new(EventType::Registered).result("platform", "promethion"),
            Event::new(EventType::Analysis)
                .skill("qc")
                .stage(Some("qc".to_string()))
                .outcome(EventOutcome::Succeeded)
                .result("reads", 1200),
        ];
        let projection = ExperimentProjection::replay(&events);
        assert_eq!(projection.status, ExperimentStatus::QcComplete);
        assert_eq!(projection.metadata["platform"], "promethion");
        assert_eq!(projection.metadata["qc"]["reads"], 1200);
    }

    #[test]
    fn failed_analysis_leaves_status_alone() {
        let events = vec![
            Event::new(EventType::Registered),
            Event::new(EventType::Analysis)
                .skill("align")
                .outcome(EventOutcome::Failed),
        ];
        assert_eq!(
            ExperimentProjection::replay(&events).status,
            ExperimentStatus::Registered
        );
    }

    #[test]
    fn archived_is_sticky_until_an_explicit_status_change() {
        let events = vec![
            Event::new(EventType::Registered),
            Event::new(EventType::StatusChange).status(ExperimentStatus::Archived),
            Event::new(EventType::PipelineStart),
            Event::new(EventType::Analysis)
                .skill("qc")
                .outcome(EventOutcome::Succeeded),
        ];
        assert_eq!(
            ExperimentProjection::replay(&events).status,
            ExperimentStatus::Archived
        );
    }

    #[test]
    fn task_transitions_track_attempts_and_errors() {
        let events = vec![
            defined(&[TaskDefinition::new("qc")]),
            Event::new(EventType::TaskStarted).task(TaskTransition::new("qc", TaskStatus::InProgress)),
            Event::new(EventType::Analysis)
                .message("reference genome missing")
                .task(TaskTransition::new("qc", TaskStatus::Failing)),
            Event::new(EventType::TaskStarted).task(TaskTransition::new("qc", TaskStatus::InProgress)),
            Event::new(EventType::Analysis).task(TaskTransition::new("qc", TaskStatus::Passing)),
        ];
        let list = replay_task_list(&events).unwrap();
        let task = list.get("qc").unwrap();
        assert_eq!(task.status, TaskStatus::Passing);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.error, None);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut list = TaskList::default();
        apply_task_event(&mut list, &defined(&[TaskDefinition::new("qc")])).unwrap();
        let error = apply_task_event(
            &mut list,
            &Event::new(EventType::Analysis).task(TaskTransition::new("qc", TaskStatus::Passing)),
        )
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
        assert_eq!(list.get("qc").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn redefinition_keeps_status_and_appends_new_tasks() {
        let mut list = TaskList::default();
        apply_task_event(&mut list, &defined(&[TaskDefinition::new("qc")])).unwrap();
        apply_task_event(
            &mut list,
            &Event::new(EventType::TaskSkipped).task(TaskTransition::new("qc", TaskStatus::Skipped)),
        )
        .unwrap();
        apply_task_event(
            &mut list,
            &defined(&[
                TaskDefinition::new("qc").stage("qc"),
                TaskDefinition::new("align").depends_on("qc"),
            ]),
        )
        .unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("qc").unwrap().status, TaskStatus::Skipped);
        assert_eq!(list.get("qc").unwrap().pipeline_stage.as_deref(), Some("qc"));
        assert_eq!(list.tasks[1].name, "align");
    }

    #[test]
    fn failed_step_stays_the_resume_point() {
        let step = |index: usize, outcome: EventOutcome| {
            Event::new(EventType::Analysis)
                .pipeline("qc-then-align", index)
                .outcome(outcome)
        };
        let mut events = vec![
            Event::new(EventType::PipelineStart)
                .pipeline("qc-then-align", 0)
                .result(STEPS_KEY, json!(["qc", "align"])),
            step(0, EventOutcome::Succeeded),
            step(1, EventOutcome::Failed),
        ];
        assert_eq!(replay_pipeline_run(&events).unwrap().next_step, 1);

        events.push(step(1, EventOutcome::Succeeded));
        assert_eq!(replay_pipeline_run(&events).unwrap().next_step, 2);
    }
}
