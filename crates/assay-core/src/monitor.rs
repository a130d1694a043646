use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cancellation::CancellationToken;
use crate::graph;
use crate::models::{
    CoreError, ExperimentId, ExperimentStatus, PipelineRun, RecordedEvent, TaskList,
};
use crate::persistence::RegistryStore;

pub type MonitorResult<T> = Result<T, CoreError>;

pub const DEFAULT_RECENT_EVENTS: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockedEntry {
    pub task: String,
    pub blocked_by: String,
}

/// Point-in-time view of one experiment. Building it never writes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub experiment: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub tags: BTreeSet<String>,
    pub tasks: TaskList,
    pub blocked: Vec<BlockedEntry>,
    pub pipeline: Option<PipelineRun>,
    pub last_seq: u64,
    pub recent_events: Vec<RecordedEvent>,
}

pub struct Monitor {
    store: Arc<dyn RegistryStore>,
    recent: usize,
}

impl Monitor {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            recent: DEFAULT_RECENT_EVENTS,
        }
    }

    pub fn with_recent_events(mut self, recent: usize) -> Self {
        self.recent = recent;
        self
    }

    pub fn snapshot(&self, id: &ExperimentId) -> MonitorResult<MonitorSnapshot> {
        let experiment = self.store.get(id)?;
        let tasks = self.store.task_list(id)?;
        let pipeline = self.store.pipeline_run(id)?;

        let blocked = graph::blocked(&tasks)
            .into_iter()
            .map(|entry| BlockedEntry {
                task: entry.task.name.clone(),
                blocked_by: entry.blocked_by.to_string(),
            })
            .collect();
        let last_seq = experiment.events.last().map_or(0, |event| event.seq);
        let skip = experiment.events.len().saturating_sub(self.recent);
        let recent_events = experiment.events.into_iter().skip(skip).collect();

        Ok(MonitorSnapshot {
            experiment: experiment.id,
            name: experiment.name,
            status: experiment.status,
            tags: experiment.tags,
            tasks,
            blocked,
            pipeline,
            last_seq,
            recent_events,
        })
    }

    /// Polls `id` every `interval` until `cancel` fires or `on_update` returns
    /// `false`. `on_update` sees an initial snapshot and then one per tick on
    /// which the event log advanced; quiet ticks are skipped. Returns the
    /// number of snapshots delivered.
    pub async fn watch<F>(
        &self,
        id: &ExperimentId,
        interval: Duration,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> MonitorResult<usize>
    where
        F: FnMut(&MonitorSnapshot) -> bool,
    {
        let mut snapshot = self.snapshot(id)?;
        let mut delivered = 1;
        if !on_update(&snapshot) {
            return Ok(delivered);
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!(experiment = %id, delivered, "monitor cancelled");
                    return Ok(delivered);
                }
            }

            if self.store.events_after(id, snapshot.last_seq)?.is_empty() {
                tracing::trace!(experiment = %id, last_seq = snapshot.last_seq, "monitor idle tick");
                continue;
            }

            snapshot = self.snapshot(id)?;
            delivered += 1;
            if !on_update(&snapshot) {
                return Ok(delivered);
            }
        }
    }
}
