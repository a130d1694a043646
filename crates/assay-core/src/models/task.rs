use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Passing,
    Failing,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Passing => "passing",
            Self::Failing => "failing",
            Self::Skipped => "skipped",
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Passing)
                | (InProgress, Failing)
                | (InProgress, Pending)
                | (Passing, InProgress)
                | (Failing, InProgress)
                | (Failing, Skipped)
                | (Skipped, Pending)
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

/// Process that started the current attempt of a task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskOwner {
    pub host: String,
    pub pid: u32,
}

impl TaskOwner {
    pub fn current() -> Self {
        Self {
            host: crate::provenance::hostname(),
            pid: std::process::id(),
        }
    }
}

/// Static shape of a task: what it is called and what it waits on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline_stage: None,
            dependencies: BTreeSet::new(),
            priority: None,
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.pipeline_stage = Some(stage.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub status: TaskStatus,
    pub pipeline_stage: Option<String>,
    pub dependencies: BTreeSet<String>,
    pub priority: Option<i32>,
    pub attempts: u32,
    pub error: Option<String>,
    pub owner: Option<TaskOwner>,
    pub started_at_ms: Option<u64>,
}

impl Task {
    pub fn from_definition(definition: TaskDefinition) -> Self {
        Self {
            name: definition.name,
            status: TaskStatus::Pending,
            pipeline_stage: definition.pipeline_stage,
            dependencies: definition.dependencies,
            priority: definition.priority,
            attempts: 0,
            error: None,
            owner: None,
            started_at_ms: None,
        }
    }

    pub fn definition(&self) -> TaskDefinition {
        TaskDefinition {
            name: self.name.clone(),
            pipeline_stage: self.pipeline_stage.clone(),
            dependencies: self.dependencies.clone(),
            priority: self.priority,
        }
    }
}

/// Tasks of one experiment, in declaration order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
}

impl TaskList {
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn definitions(&self) -> Vec<TaskDefinition> {
        self.tasks.iter().map(Task::definition).collect()
    }

    pub fn dependencies_passing(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dependency| {
            self.get(dependency)
                .is_some_and(|upstream| upstream.status == TaskStatus::Passing)
        })
    }
}

/// Task status change carried by an event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub name: String,
    pub to: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<TaskOwner>,
}

impl TaskTransition {
    pub fn new(name: impl Into<String>, to: TaskStatus) -> Self {
        Self {
            name: name.into(),
            to,
            owner: None,
        }
    }

    pub fn owner(mut self, owner: TaskOwner) -> Self {
        self.owner = Some(owner);
        self
    }
}
