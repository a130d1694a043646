use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use assay_core::cancellation::CancellationToken;
use assay_core::export::{collect_export, export_experiment};
use assay_core::graph::{TaskGraph, TaskResolution};
use assay_core::models::{
    CoreErrorKind, Event, EventType, ExperimentId, NewExperiment, TaskDefinition, TaskStatus,
};
use assay_core::monitor::Monitor;
use assay_core::persistence::RegistryStore;
use assay_core::sqlite::SqliteStore;

fn temp_root(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!(
        "assay-monitor-{name}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn setup(root: &std::path::Path) -> (Arc<dyn RegistryStore>, ExperimentId) {
    let store = SqliteStore::new(root.join("registry.sqlite3"));
    store.migrate_to_latest().unwrap();
    let id = store
        .create(NewExperiment::new("run3", "/data/run3").tag("flongle"))
        .unwrap();
    let store: Arc<dyn RegistryStore> = Arc::new(store);

    let graph = TaskGraph::new(store.clone());
    graph
        .define_tasks(
            &id,
            vec![
                TaskDefinition::new("qc").stage("qc"),
                TaskDefinition::new("align").stage("alignment").depends_on("qc"),
            ],
        )
        .unwrap();
    graph.mark_started(&id, "qc").unwrap();
    graph
        .mark_result(&id, "qc", TaskResolution::Failing, Some("no reads".to_string()))
        .unwrap();
    (store, id)
}

#[test]
fn snapshot_reports_tasks_blockers_and_recent_events() {
    let root = temp_root("snapshot");
    let (store, id) = setup(&root);
    let before = store.events(&id).unwrap().len();

    let snapshot = Monitor::new(store.clone())
        .with_recent_events(2)
        .snapshot(&id)
        .unwrap();

    assert_eq!(snapshot.experiment, id);
    assert_eq!(snapshot.name, "run3");
    assert!(snapshot.tags.contains("flongle"));
    assert_eq!(snapshot.tasks.get("qc").unwrap().status, TaskStatus::Failing);
    assert_eq!(snapshot.blocked.len(), 1);
    assert_eq!(snapshot.blocked[0].task, "align");
    assert_eq!(snapshot.blocked[0].blocked_by, "qc");
    assert_eq!(snapshot.last_seq, before as u64);
    assert_eq!(snapshot.recent_events.len(), 2);
    assert_eq!(snapshot.recent_events[1].seq, before as u64);
    assert!(snapshot.pipeline.is_none());

    // Taking a snapshot never writes.
    assert_eq!(store.events(&id).unwrap().len(), before);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn snapshot_of_unknown_experiment_is_not_found() {
    let root = temp_root("unknown");
    let (store, _) = setup(&root);
    let error = Monitor::new(store)
        .snapshot(&ExperimentId::new("exp-nope"))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn watch_delivers_only_when_the_log_advances() {
    let root = temp_root("watch");
    let (store, id) = setup(&root);
    let monitor = Monitor::new(store.clone());
    let cancel = CancellationToken::new();

    let writer_store = store.clone();
    let writer_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        writer_store
            .append_event(&writer_id, Event::new(EventType::Note).message("operator note"))
            .unwrap();
    });

    let mut seen = Vec::new();
    let delivered = tokio::time::timeout(
        Duration::from_secs(10),
        monitor.watch(&id, Duration::from_millis(30), &cancel, |snapshot| {
            seen.push(snapshot.last_seq);
            seen.len() < 2
        }),
    )
    .await
    .expect("watch must stop once the callback declines")
    .unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(seen[1], seen[0] + 1);
    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn watch_stops_on_cancellation() {
    let root = temp_root("watch-cancel");
    let (store, id) = setup(&root);
    let monitor = Monitor::new(store);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let delivered = tokio::time::timeout(
        Duration::from_secs(10),
        monitor.watch(&id, Duration::from_millis(20), &cancel, |_| true),
    )
    .await
    .expect("cancelled watch must return")
    .unwrap();
    assert_eq!(delivered, 1);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn export_writes_a_complete_json_document() {
    let root = temp_root("export");
    let (store, id) = setup(&root);
    let out = root.join("exports");

    let path = export_experiment(store.as_ref(), &id, &out).unwrap();
    assert_eq!(path, out.join(format!("{id}.json")));

    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(document["experiment"]["id"], id.as_str());
    assert_eq!(document["experiment"]["location"], "/data/run3");
    let events = document["experiment"]["events"].as_array().unwrap();
    assert_eq!(events.len(), store.events(&id).unwrap().len());
    assert_eq!(document["tasks"]["tasks"][0]["name"], "qc");
    assert_eq!(document["tasks"]["tasks"][0]["status"], "failing");
    assert!(document["pipeline_run"].is_null());

    // A second export replaces the first.
    store
        .append_event(&id, Event::new(EventType::Note).message("re-export"))
        .unwrap();
    export_experiment(store.as_ref(), &id, &out).unwrap();
    let again = collect_export(store.as_ref(), &id).unwrap();
    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        document["experiment"]["events"].as_array().unwrap().len(),
        again.experiment.events.len()
    );
    let _ = std::fs::remove_dir_all(root);
}
