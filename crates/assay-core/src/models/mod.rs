pub mod error;
pub mod event;
pub mod experiment;
pub mod pipeline;
pub mod task;

pub use error::{CoreError, CoreErrorKind};
pub use event::{
    Event, EventId, EventOutcome, EventType, HpcContext, OutputArtifact, PipelineMark,
    RecordedEvent, TIMEOUT_EXIT_CODE, now_ms,
};
pub use experiment::{Experiment, ExperimentFilter, ExperimentId, ExperimentStatus, NewExperiment};
pub use pipeline::{PipelineDefinition, PipelineRun, PipelineRunState, PipelineStep};
pub use task::{Task, TaskDefinition, TaskList, TaskOwner, TaskStatus, TaskTransition};
