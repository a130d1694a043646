use std::path::PathBuf;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use assay_core::graph::{self, StalePolicy, TaskGraph, TaskResolution};
use assay_core::models::{
    CoreErrorKind, Event, EventType, Experiment, ExperimentFilter, ExperimentId, NewExperiment,
    PipelineRun, RecordedEvent, TaskDefinition, TaskList, TaskOwner, TaskStatus,
};
use assay_core::persistence::{AppendOutcome, PersistenceResult, RegistryStore};
use assay_core::provenance::hostname;
use assay_core::sqlite::SqliteStore;

fn test_db_path(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "assay-graph-{name}-{}-{nanos}.sqlite3",
        std::process::id()
    ))
}

fn setup(name: &str) -> (Arc<dyn RegistryStore>, ExperimentId) {
    let store = SqliteStore::new(test_db_path(name));
    store.migrate_to_latest().unwrap();
    let id = store
        .create(NewExperiment::new(name, format!("/data/{name}")))
        .unwrap();
    (Arc::new(store), id)
}

fn standard_tasks() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("basecall").stage("basecalling"),
        TaskDefinition::new("qc").stage("qc").depends_on("basecall"),
        TaskDefinition::new("align")
            .stage("alignment")
            .depends_on("basecall"),
        TaskDefinition::new("report").depends_on("qc").depends_on("align"),
    ]
}

/// Hands out one task list captured earlier, the view a starter has when
/// another process commits between its read and its append.
struct StaleReadStore {
    inner: Arc<dyn RegistryStore>,
    stale: Mutex<Option<TaskList>>,
}

impl RegistryStore for StaleReadStore {
    fn create(&self, experiment: NewExperiment) -> PersistenceResult<ExperimentId> {
        self.inner.create(experiment)
    }

    fn get(&self, id: &ExperimentId) -> PersistenceResult<Experiment> {
        self.inner.get(id)
    }

    fn list(&self, filter: &ExperimentFilter) -> PersistenceResult<Vec<Experiment>> {
        self.inner.list(filter)
    }

    fn append_event(&self, id: &ExperimentId, event: Event) -> PersistenceResult<AppendOutcome> {
        self.inner.append_event(id, event)
    }

    fn events_after(
        &self,
        id: &ExperimentId,
        after_seq: u64,
    ) -> PersistenceResult<Vec<RecordedEvent>> {
        self.inner.events_after(id, after_seq)
    }

    fn task_list(&self, id: &ExperimentId) -> PersistenceResult<TaskList> {
        match self.stale.lock().unwrap().take() {
            Some(list) => Ok(list),
            None => self.inner.task_list(id),
        }
    }

    fn pipeline_run(&self, id: &ExperimentId) -> PersistenceResult<Option<PipelineRun>> {
        self.inner.pipeline_run(id)
    }
}

fn started_events(store: &dyn RegistryStore, id: &ExperimentId, task: &str) -> usize {
    store
        .events(id)
        .unwrap()
        .iter()
        .filter(|recorded| {
            recorded.event.event_type == EventType::TaskStarted
                && recorded
                    .event
                    .task
                    .as_ref()
                    .is_some_and(|transition| transition.name == task)
        })
        .count()
}

/// Pid of a child that has already exited and been reaped.
#[cfg(unix)]
fn reaped_pid() -> u32 {
    let mut child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("exit 0")
        .spawn()
        .unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn cyclic_definitions_are_rejected_without_partial_state() {
    let (store, id) = setup("cycle");
    let graph = TaskGraph::new(store.clone());

    let error = graph
        .define_tasks(
            &id,
            vec![
                TaskDefinition::new("qc").depends_on("align"),
                TaskDefinition::new("align").depends_on("qc"),
            ],
        )
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::ValidationError);
    assert!(error.message.contains("cycle"), "{}", error.message);
    assert!(store.task_list(&id).unwrap().is_empty());
    assert_eq!(store.events(&id).unwrap().len(), 1);
}

#[test]
fn unknown_dependency_and_duplicate_names_are_rejected() {
    let (store, id) = setup("invalid");
    let graph = TaskGraph::new(store.clone());

    let error = graph
        .define_tasks(&id, vec![TaskDefinition::new("qc").depends_on("basecall")])
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ValidationError);
    assert!(error.message.contains("basecall"), "{}", error.message);

    let error = graph
        .define_tasks(&id, vec![TaskDefinition::new("qc"), TaskDefinition::new("qc")])
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ValidationError);
    assert!(store.task_list(&id).unwrap().is_empty());
}

#[test]
fn later_definitions_may_depend_on_existing_tasks() {
    let (store, id) = setup("extend");
    let graph = TaskGraph::new(store);

    graph
        .define_tasks(&id, vec![TaskDefinition::new("basecall")])
        .unwrap();
    let merged = graph
        .define_tasks(&id, vec![TaskDefinition::new("qc").depends_on("basecall")])
        .unwrap();

    assert_eq!(merged.len(), 2);
    assert!(merged.get("qc").unwrap().dependencies.contains("basecall"));
}

#[test]
fn next_runnable_follows_dependencies_then_priority() {
    let (store, id) = setup("next");
    let graph = TaskGraph::new(store);

    let mut tasks = standard_tasks();
    tasks[2] = tasks[2].clone().priority(5);
    graph.define_tasks(&id, tasks).unwrap();

    assert_eq!(graph.next_runnable(&id).unwrap().unwrap().name, "basecall");

    graph.mark_started(&id, "basecall").unwrap();
    assert!(graph.next_runnable(&id).unwrap().is_none());

    graph
        .mark_result(&id, "basecall", TaskResolution::Passing, None)
        .unwrap();
    // align outranks qc by priority even though qc was declared first.
    assert_eq!(graph.next_runnable(&id).unwrap().unwrap().name, "align");
}

#[test]
fn starting_a_task_with_unmet_dependencies_fails() {
    let (store, id) = setup("unmet");
    let graph = TaskGraph::new(store.clone());
    graph.define_tasks(&id, standard_tasks()).unwrap();

    let error = graph.mark_started(&id, "report").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ValidationError);
    assert!(error.message.contains("waiting on"), "{}", error.message);
    assert_eq!(
        store.task_list(&id).unwrap().get("report").unwrap().status,
        TaskStatus::Pending
    );
}

#[test]
fn failing_ancestor_blocks_descendants() {
    let (store, id) = setup("blocked");
    let graph = TaskGraph::new(store.clone());
    graph.define_tasks(&id, standard_tasks()).unwrap();

    graph.mark_started(&id, "basecall").unwrap();
    graph
        .mark_result(
            &id,
            "basecall",
            TaskResolution::Failing,
            Some("pod5 directory is empty".to_string()),
        )
        .unwrap();

    let list = store.task_list(&id).unwrap();
    let basecall = list.get("basecall").unwrap();
    assert_eq!(basecall.status, TaskStatus::Failing);
    assert_eq!(basecall.error.as_deref(), Some("pod5 directory is empty"));

    let blocked = graph::blocked(&list);
    let names: Vec<&str> = blocked.iter().map(|entry| entry.task.name.as_str()).collect();
    assert_eq!(names, vec!["qc", "align", "report"]);
    assert!(blocked.iter().all(|entry| entry.blocked_by == "basecall"));
    assert!(graph::next_runnable(&list).is_none());
}

#[test]
fn skipped_tasks_can_be_requeued() {
    let (store, id) = setup("skip");
    let graph = TaskGraph::new(store.clone());
    graph.define_tasks(&id, standard_tasks()).unwrap();

    graph.mark_skipped(&id, "basecall", "already basecalled upstream").unwrap();
    assert_eq!(
        store.task_list(&id).unwrap().get("basecall").unwrap().status,
        TaskStatus::Skipped
    );

    graph.requeue(&id, "basecall", "basecall again").unwrap();
    assert_eq!(
        store.task_list(&id).unwrap().get("basecall").unwrap().status,
        TaskStatus::Pending
    );

    let error = graph.requeue(&id, "basecall", "twice").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
}

#[test]
fn unknown_task_is_not_found() {
    let (store, id) = setup("unknown-task");
    let graph = TaskGraph::new(store);
    let error = graph.mark_started(&id, "variant_call").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
    assert_eq!(error.task.as_deref(), Some("variant_call"));
}

#[cfg(unix)]
#[test]
fn task_owned_by_a_dead_local_process_is_reclaimed() {
    let (store, id) = setup("stale-local");
    let crashed = TaskGraph::new(store.clone()).with_owner(TaskOwner {
        host: hostname(),
        pid: reaped_pid(),
    });
    crashed.define_tasks(&id, standard_tasks()).unwrap();
    let started = crashed.mark_started(&id, "basecall").unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    assert_eq!(started.attempts, 1);

    let graph = TaskGraph::new(store.clone());
    let list = graph.load_task_list(&id).unwrap();
    let basecall = list.get("basecall").unwrap();
    assert_eq!(basecall.status, TaskStatus::Pending);
    assert_eq!(basecall.attempts, 1);

    let events = store.events(&id).unwrap();
    let abandoned: Vec<_> = events
        .iter()
        .filter(|recorded| recorded.event.event_type == EventType::TaskAbandoned)
        .collect();
    assert_eq!(abandoned.len(), 1);

    // A second loader does not record the abandonment twice.
    graph.load_task_list(&id).unwrap();
    assert_eq!(store.events(&id).unwrap().len(), events.len());

    let restarted = graph.mark_started(&id, "basecall").unwrap();
    assert_eq!(restarted.attempts, 2);
}

#[test]
fn live_local_owner_is_left_alone() {
    let (store, id) = setup("stale-live");
    let graph = TaskGraph::new(store.clone()).with_stale_policy(StalePolicy {
        stale_after: Duration::ZERO,
    });
    graph.define_tasks(&id, standard_tasks()).unwrap();
    graph.mark_started(&id, "basecall").unwrap();

    let list = graph.load_task_list(&id).unwrap();
    assert_eq!(list.get("basecall").unwrap().status, TaskStatus::InProgress);
}

#[test]
fn remote_owner_is_reclaimed_only_after_the_stale_window() {
    let (store, id) = setup("stale-remote");
    let remote = TaskGraph::new(store.clone()).with_owner(TaskOwner {
        host: format!("{}-elsewhere", hostname()),
        pid: 4242,
    });
    remote.define_tasks(&id, standard_tasks()).unwrap();
    remote.mark_started(&id, "basecall").unwrap();

    let patient = TaskGraph::new(store.clone());
    let list = patient.load_task_list(&id).unwrap();
    assert_eq!(list.get("basecall").unwrap().status, TaskStatus::InProgress);

    let impatient = TaskGraph::new(store.clone()).with_stale_policy(StalePolicy {
        stale_after: Duration::ZERO,
    });
    let list = impatient.load_task_list(&id).unwrap();
    assert_eq!(list.get("basecall").unwrap().status, TaskStatus::Pending);
}

#[test]
fn starting_an_attempt_someone_else_claimed_is_a_conflict() {
    let (store, id) = setup("claimed");
    let graph = TaskGraph::new(store.clone());
    graph.define_tasks(&id, standard_tasks()).unwrap();
    let before = store.task_list(&id).unwrap();

    graph.mark_started(&id, "basecall").unwrap();

    let late: Arc<dyn RegistryStore> = Arc::new(StaleReadStore {
        inner: store.clone(),
        stale: Mutex::new(Some(before)),
    });
    let error = TaskGraph::new(late)
        .mark_started(&id, "basecall")
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::StoreConflict);
    assert_eq!(error.task.as_deref(), Some("basecall"));
    assert_eq!(started_events(store.as_ref(), &id, "basecall"), 1);
    let basecall = store.task_list(&id).unwrap().get("basecall").cloned().unwrap();
    assert_eq!(basecall.status, TaskStatus::InProgress);
    assert_eq!(basecall.attempts, 1);
}

#[test]
fn concurrent_starts_of_one_task_admit_a_single_attempt() {
    let (store, id) = setup("concurrent-start");
    TaskGraph::new(store.clone())
        .define_tasks(&id, standard_tasks())
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let starters: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let graph = TaskGraph::new(store);
                barrier.wait();
                graph.mark_started(&id, "basecall")
            })
        })
        .collect();
    let outcomes: Vec<_> = starters
        .into_iter()
        .map(|starter| starter.join().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    let error = outcomes
        .into_iter()
        .find_map(Result::err)
        .unwrap();
    assert!(
        matches!(
            error.kind,
            CoreErrorKind::StoreConflict | CoreErrorKind::InvalidTransition
        ),
        "{error:?}"
    );
    assert_eq!(started_events(store.as_ref(), &id, "basecall"), 1);
}
