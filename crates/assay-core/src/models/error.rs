use crate::models::ExperimentId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    AlreadyExists,
    ValidationError,
    InvalidTransition,
    ExecutionFailure,
    Timeout,
    Cancelled,
    ProvenanceFailure,
    ParseFailure,
    StoreConflict,
    StorageFailure,
    ConfigError,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub experiment: Option<ExperimentId>,
    pub skill: Option<String>,
    pub task: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            experiment: None,
            skill: None,
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn experiment(mut self, experiment: &ExperimentId) -> Self {
        self.experiment = Some(experiment.clone());
        self
    }

    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Fills in attribution the error does not already carry.
    pub fn attribute(
        mut self,
        experiment: Option<&ExperimentId>,
        skill: Option<&str>,
        task: Option<&str>,
    ) -> Self {
        if self.experiment.is_none() {
            self.experiment = experiment.cloned();
        }
        if self.skill.is_none() {
            self.skill = skill.map(str::to_string);
        }
        if self.task.is_none() {
            self.task = task.map(str::to_string);
        }
        self
    }
}
