use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    pub skill: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

fn default_required() -> bool {
    true
}

impl PipelineStep {
    pub fn new(name: impl Into<String>, skill: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skill: skill.into(),
            args: Vec::new(),
            required: true,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.insert(step.into());
        self
    }
}

/// Read-only pipeline template. Execution state never lives here.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|step| step.name == name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunState {
    Running,
    Halted,
    Interrupted,
    Completed,
}

impl PipelineRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Halted => "halted",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
        }
    }
}

/// Progress of the latest pipeline run of an experiment, projected from its
/// pipeline events.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline: String,
    pub steps: Vec<String>,
    pub next_step: usize,
    pub state: PipelineRunState,
    pub failed_step: Option<String>,
    pub halt_skipped: Vec<String>,
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
}

impl PipelineRun {
    pub fn is_finished(&self) -> bool {
        self.state == PipelineRunState::Completed
    }

    pub fn remaining_steps(&self) -> &[String] {
        let start = self.next_step.min(self.steps.len());
        &self.steps[start..]
    }
}
