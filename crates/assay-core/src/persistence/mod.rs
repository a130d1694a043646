use crate::models::{
    CoreError, Event, EventType, Experiment, ExperimentFilter, ExperimentId, ExperimentStatus,
    NewExperiment, PipelineRun, RecordedEvent, TaskList,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Appended { seq: u64 },
    /// The log already held an event with this id; nothing changed.
    Duplicate,
}

impl AppendOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Experiments and their append-only event logs.
///
/// `append_event` is the only mutation after creation. Implementations apply
/// it atomically per experiment, reject task transitions the state machine
/// forbids, and update every projection in the same commit.
pub trait RegistryStore: Send + Sync {
    fn create(&self, experiment: NewExperiment) -> PersistenceResult<ExperimentId>;

    fn get(&self, id: &ExperimentId) -> PersistenceResult<Experiment>;

    fn list(&self, filter: &ExperimentFilter) -> PersistenceResult<Vec<Experiment>>;

    fn append_event(&self, id: &ExperimentId, event: Event) -> PersistenceResult<AppendOutcome>;

    fn events_after(&self, id: &ExperimentId, after_seq: u64)
    -> PersistenceResult<Vec<RecordedEvent>>;

    fn task_list(&self, id: &ExperimentId) -> PersistenceResult<TaskList>;

    fn pipeline_run(&self, id: &ExperimentId) -> PersistenceResult<Option<PipelineRun>>;

    fn events(&self, id: &ExperimentId) -> PersistenceResult<Vec<RecordedEvent>> {
        self.events_after(id, 0)
    }

    /// Overrides the experiment's status with a `status_change` event. Once
    /// archived, analysis events no longer move the status.
    fn set_status(
        &self,
        id: &ExperimentId,
        status: ExperimentStatus,
        reason: Option<&str>,
    ) -> PersistenceResult<AppendOutcome> {
        let message = match reason {
            Some(reason) => format!("status set to {}: {reason}", status.as_str()),
            None => format!("status set to {}", status.as_str()),
        };
        self.append_event(
            id,
            Event::new(EventType::StatusChange).status(status).message(message),
        )
    }

    fn archive(&self, id: &ExperimentId, reason: Option<&str>) -> PersistenceResult<AppendOutcome> {
        self.set_status(id, ExperimentStatus::Archived, reason)
    }
}
