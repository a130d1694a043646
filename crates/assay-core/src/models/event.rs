use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{ExperimentStatus, TaskTransition};

/// Exit code recorded when a skill is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Deterministic id: the same parts always produce the same id, which is
    /// what makes a retried commit of one attempt a duplicate.
    pub fn derive(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let hex = format!("{:x}", hasher.finalize());
        Self(format!("evt-{}", &hex[..20]))
    }

    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::derive(&[
            &nanos.to_string(),
            &std::process::id().to_string(),
            &counter.to_string(),
        ])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Discovered,
    Registered,
    Analysis,
    StatusChange,
    PipelineStart,
    PipelineComplete,
    Note,
    Error,
    TasksDefined,
    TaskStarted,
    TaskAbandoned,
    TaskSkipped,
    TaskRequeued,
    PipelineHalted,
    PipelineResume,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Registered => "registered",
            Self::Analysis => "analysis",
            Self::StatusChange => "status_change",
            Self::PipelineStart => "pipeline_start",
            Self::PipelineComplete => "pipeline_complete",
            Self::Note => "note",
            Self::Error => "error",
            Self::TasksDefined => "tasks_defined",
            Self::TaskStarted => "task_started",
            Self::TaskAbandoned => "task_abandoned",
            Self::TaskSkipped => "task_skipped",
            Self::TaskRequeued => "task_requeued",
            Self::PipelineHalted => "pipeline_halted",
            Self::PipelineResume => "pipeline_resume",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    ProvenanceFailed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub path: String,
    pub checksum: String,
}

/// Batch-scheduler context captured from the environment at dispatch time.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HpcContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<String>,
}

impl HpcContext {
    pub fn is_empty(&self) -> bool {
        self.job_id.is_none()
            && self.partition.is_none()
            && self.node_list.is_none()
            && self.gpus.is_none()
    }
}

/// Attributes an event to one step of a pipeline run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipelineMark {
    pub pipeline: String,
    pub step_index: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<EventOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputArtifact>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpc: Option<HpcContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExperimentStatus>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineMark>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: EventId::generate(),
            timestamp_ms: now_ms(),
            event_type,
            skill: None,
            command: None,
            duration_ms: None,
            exit_code: None,
            outcome: None,
            outputs: Vec::new(),
            results: BTreeMap::new(),
            hpc: None,
            message: None,
            stage: None,
            status: None,
            tags: BTreeSet::new(),
            task: None,
            pipeline: None,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn stage(mut self, stage: Option<String>) -> Self {
        self.stage = stage;
        self
    }

    pub fn status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn outcome(mut self, outcome: EventOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn result(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.results.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn task(mut self, transition: TaskTransition) -> Self {
        self.task = Some(transition);
        self
    }

    pub fn pipeline(mut self, pipeline: impl Into<String>, step_index: usize) -> Self {
        self.pipeline = Some(PipelineMark {
            pipeline: pipeline.into(),
            step_index,
        });
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Some(EventOutcome::Succeeded)
    }
}

/// An event as committed: `seq` is its position in the experiment's log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{Event, EventId, EventType};

    #[test]
    fn derived_ids_are_stable_and_part_sensitive() {
        let first = EventId::derive(&["exp-1", "qc", "1", "result"]);
        let again = EventId::derive(&["exp-1", "qc", "1", "result"]);
        let other = EventId::derive(&["exp-1", "qc", "2", "result"]);
        assert_eq!(first, again);
        assert_ne!(first, other);
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        assert_ne!(EventId::derive(&["ab", "c"]), EventId::derive(&["a", "bc"]));
    }

    #[test]
    fn generated_ids_do_not_collide() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn event_serializes_with_type_and_timestamp_keys() {
        let event = Event::new(EventType::Note).message("flowcell swapped");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "note");
        assert!(json["timestamp"].is_u64());
        assert!(json.get("outputs").is_none());
    }
}
