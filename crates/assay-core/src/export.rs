use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::models::{
    CoreError, CoreErrorKind, Experiment, ExperimentId, PipelineRun, TaskList, now_ms,
};
use crate::persistence::RegistryStore;

pub type ExportResult<T> = Result<T, CoreError>;

/// Human-inspectable record of one experiment: the registry row, its full
/// event log, and the projections derived from it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExperimentExport {
    pub exported_at_ms: u64,
    pub experiment: Experiment,
    pub tasks: TaskList,
    pub pipeline_run: Option<PipelineRun>,
}

pub fn collect_export(store: &dyn RegistryStore, id: &ExperimentId) -> ExportResult<ExperimentExport> {
    Ok(ExperimentExport {
        exported_at_ms: now_ms(),
        experiment: store.get(id)?,
        tasks: store.task_list(id)?,
        pipeline_run: store.pipeline_run(id)?,
    })
}

/// Writes `<dir>/<id>.json`, replacing any previous export atomically.
pub fn export_experiment(
    store: &dyn RegistryStore,
    id: &ExperimentId,
    dir: &Path,
) -> ExportResult<PathBuf> {
    let document = collect_export(store, id)?;
    let bytes = serde_json::to_vec_pretty(&document).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to serialize export: {error}"),
        )
        .experiment(id)
    })?;

    let path = dir.join(format!("{id}.json"));
    atomic_write_bytes(&path, &bytes).map_err(|error| {
        CoreError::new(
            CoreErrorKind::StorageFailure,
            format!("failed to write export '{}': {error}", path.display()),
        )
        .experiment(id)
    })?;

    tracing::info!(experiment = %id, path = %path.display(), "exported experiment");
    Ok(path)
}

/// Temp file in the same directory, fsync, rename over `path`, fsync the
/// directory.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("export");
    let temp = path.with_file_name(format!(".{name}.tmp.{}.{}", std::process::id(), now_ms()));

    let result = (|| {
        let mut file = fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}
