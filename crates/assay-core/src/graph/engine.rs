use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::graph::{self, GraphResult};
use crate::models::{
    CoreError, CoreErrorKind, Event, EventId, EventOutcome, EventType, ExperimentId, Task,
    TaskDefinition, TaskList, TaskOwner, TaskStatus, TaskTransition, now_ms,
};
use crate::persistence::{AppendOutcome, RegistryStore};
use crate::projection::{TASKS_KEY, apply_task_event};
use crate::provenance::process_alive;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// When an `in_progress` task whose owner cannot be probed is considered
/// abandoned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StalePolicy {
    pub stale_after: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskResolution {
    Passing,
    Failing,
    /// Back to pending without consuming the attempt's verdict (cancellation).
    Released,
}

impl TaskResolution {
    pub fn status(self) -> TaskStatus {
        match self {
            Self::Passing => TaskStatus::Passing,
            Self::Failing => TaskStatus::Failing,
            Self::Released => TaskStatus::Pending,
        }
    }
}

/// Store-backed view of one experiment's task list. Every change is an
/// appended event; nothing here holds task state between calls.
pub struct TaskGraph {
    store: Arc<dyn RegistryStore>,
    stale: StalePolicy,
    owner: TaskOwner,
}

impl TaskGraph {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            stale: StalePolicy::default(),
            owner: TaskOwner::current(),
        }
    }

    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale = policy;
        self
    }

    pub fn with_owner(mut self, owner: TaskOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn owner(&self) -> &TaskOwner {
        &self.owner
    }

    /// Loads the task list, first returning abandoned `in_progress` tasks to
    /// `pending` with a `task_abandoned` event each.
    pub fn load_task_list(&self, experiment: &ExperimentId) -> GraphResult<TaskList> {
        let list = self.store.task_list(experiment)?;
        let now = now_ms();
        let mut recovered = false;

        for task in list
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::InProgress)
        {
            let Some(reason) = self.stale_reason(task, now) else {
                continue;
            };

            let event = Event::new(EventType::TaskAbandoned)
                .with_id(EventId::derive(&[
                    experiment.as_str(),
                    &task.name,
                    &task.attempts.to_string(),
                    "abandoned",
                ]))
                .message(reason.clone())
                .task(TaskTransition::new(task.name.clone(), TaskStatus::Pending));

            match self.store.append_event(experiment, event) {
                Ok(_) => {
                    recovered = true;
                    tracing::warn!(
                        experiment = %experiment,
                        task = %task.name,
                        attempt = task.attempts,
                        message = %reason,
                        "reclaimed abandoned task"
                    );
                }
                // Another process settled the task between our read and the append.
                Err(error) if error.kind == CoreErrorKind::InvalidTransition => {
                    recovered = true;
                }
                Err(error) => return Err(error),
            }
        }

        if recovered {
            self.store.task_list(experiment)
        } else {
            Ok(list)
        }
    }

    pub fn next_runnable(&self, experiment: &ExperimentId) -> GraphResult<Option<Task>> {
        let list = self.load_task_list(experiment)?;
        Ok(graph::next_runnable(&list).cloned())
    }

    /// Merges `definitions` into the experiment's task list. The merged list is
    /// validated before anything is written, so a rejected call leaves no trace.
    pub fn define_tasks(
        &self,
        experiment: &ExperimentId,
        definitions: Vec<TaskDefinition>,
    ) -> GraphResult<TaskList> {
        let mut seen = std::collections::BTreeSet::new();
        if let Some(duplicate) = definitions
            .iter()
            .find(|definition| !seen.insert(definition.name.as_str()))
        {
            return Err(CoreError::new(
                CoreErrorKind::ValidationError,
                format!("task '{}' is declared more than once", duplicate.name),
            )
            .experiment(experiment));
        }

        let mut merged = self.store.task_list(experiment)?;
        let event = Event::new(EventType::TasksDefined)
            .message(format!("defined {} task(s)", definitions.len()))
            .result(TASKS_KEY, json!(definitions));
        apply_task_event(&mut merged, &event).map_err(|error| error.experiment(experiment))?;
        graph::validate_task_list(&merged).map_err(|error| error.experiment(experiment))?;

        self.store.append_event(experiment, event)?;
        tracing::debug!(
            experiment = %experiment,
            tasks = merged.len(),
            "task definitions recorded"
        );
        Ok(merged)
    }

    /// Moves `task` to `in_progress` under this graph's owner. The task must be
    /// pending (or a re-run of a settled task) with every dependency passing.
    /// Losing a race for the same attempt is a `StoreConflict`.
    pub fn mark_started(&self, experiment: &ExperimentId, task: &str) -> GraphResult<Task> {
        let list = self.store.task_list(experiment)?;
        let current = list.get(task).ok_or_else(|| unknown_task(experiment, task))?;
        if !list.dependencies_passing(current) {
            let waiting: Vec<_> = current
                .dependencies
                .iter()
                .filter(|dependency| {
                    list.get(dependency)
                        .is_none_or(|upstream| upstream.status != TaskStatus::Passing)
                })
                .map(String::as_str)
                .collect();
            return Err(CoreError::new(
                CoreErrorKind::ValidationError,
                format!(
                    "task '{task}' is not runnable; waiting on: {}",
                    waiting.join(", ")
                ),
            )
            .experiment(experiment)
            .task(task));
        }

        let attempt = current.attempts + 1;
        let event = Event::new(EventType::TaskStarted)
            .with_id(EventId::derive(&[
                experiment.as_str(),
                task,
                &attempt.to_string(),
                "started",
            ]))
            .message(format!("attempt {attempt} started by pid {}", self.owner.pid))
            .task(TaskTransition::new(task, TaskStatus::InProgress).owner(self.owner.clone()));
        let outcome = self
            .store
            .append_event(experiment, event)
            .map_err(|error| error.attribute(Some(experiment), None, Some(task)))?;

        // The start id is derived from the attempt number, so a duplicate means
        // another starter claimed this attempt after our read.
        if outcome.is_duplicate() {
            tracing::warn!(
                experiment = %experiment,
                task,
                attempt,
                "attempt already claimed by another starter"
            );
            return Err(CoreError::new(
                CoreErrorKind::StoreConflict,
                format!("attempt {attempt} of task '{task}' was started concurrently"),
            )
            .experiment(experiment)
            .task(task));
        }

        self.store
            .task_list(experiment)?
            .get(task)
            .cloned()
            .ok_or_else(|| unknown_task(experiment, task))
    }

    /// Records the verdict of the current attempt of `task` on its own event.
    pub fn mark_result(
        &self,
        experiment: &ExperimentId,
        task: &str,
        resolution: TaskResolution,
        error: Option<String>,
    ) -> GraphResult<AppendOutcome> {
        let outcome = match resolution {
            TaskResolution::Passing => EventOutcome::Succeeded,
            TaskResolution::Failing => EventOutcome::Failed,
            TaskResolution::Released => EventOutcome::Cancelled,
        };
        let mut event = Event::new(EventType::Note).outcome(outcome);
        if let Some(error) = error {
            event = event.message(error);
        }
        self.record_result(experiment, task, resolution, event)
    }

    /// Appends `event` carrying the transition for `resolution`, so the verdict
    /// and the record that justifies it commit together.
    pub fn record_result(
        &self,
        experiment: &ExperimentId,
        task: &str,
        resolution: TaskResolution,
        event: Event,
    ) -> GraphResult<AppendOutcome> {
        let event = event.task(TaskTransition::new(task, resolution.status()));
        self.store
            .append_event(experiment, event)
            .map_err(|error| error.attribute(Some(experiment), None, Some(task)))
    }

    /// Forces `task` to `skipped` (from pending or failing).
    pub fn mark_skipped(
        &self,
        experiment: &ExperimentId,
        task: &str,
        reason: &str,
    ) -> GraphResult<AppendOutcome> {
        self.store
            .append_event(experiment, skip_event(task, reason))
            .map_err(|error| error.attribute(Some(experiment), None, Some(task)))
    }

    /// Returns a skipped task to `pending`.
    pub fn requeue(
        &self,
        experiment: &ExperimentId,
        task: &str,
        reason: &str,
    ) -> GraphResult<AppendOutcome> {
        let event = Event::new(EventType::TaskRequeued)
            .message(reason)
            .task(TaskTransition::new(task, TaskStatus::Pending));
        self.store
            .append_event(experiment, event)
            .map_err(|error| error.attribute(Some(experiment), None, Some(task)))
    }

    fn stale_reason(&self, task: &Task, now: u64) -> Option<String> {
        let age_ms = now.saturating_sub(task.started_at_ms.unwrap_or(0));
        let expired = u128::from(age_ms) >= self.stale.stale_after.as_millis();

        match &task.owner {
            Some(owner) if owner.host == self.owner.host => {
                if owner.pid == self.owner.pid || process_alive(owner.pid) {
                    None
                } else {
                    Some(format!(
                        "owner process {} on '{}' is no longer running",
                        owner.pid, owner.host
                    ))
                }
            }
            Some(owner) => expired.then(|| {
                format!(
                    "owner on host '{}' started attempt {} {}s ago",
                    owner.host,
                    task.attempts,
                    age_ms / 1000
                )
            }),
            None => expired.then(|| {
                format!(
                    "attempt {} has no recorded owner and started {}s ago",
                    task.attempts,
                    age_ms / 1000
                )
            }),
        }
    }
}

pub fn skip_event(task: &str, reason: &str) -> Event {
    Event::new(EventType::TaskSkipped)
        .message(reason)
        .task(TaskTransition::new(task, TaskStatus::Skipped))
}

fn unknown_task(experiment: &ExperimentId, task: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("task '{task}' is not defined for experiment '{experiment}'"),
    )
    .experiment(experiment)
    .task(task)
}
