use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::graph;
use crate::models::{
    CoreError, CoreErrorKind, Event, EventType, Experiment, ExperimentFilter, ExperimentId,
    ExperimentStatus, NewExperiment, PipelineRun, RecordedEvent, Task, TaskList, now_ms,
};
use crate::persistence::{AppendOutcome, MigrationStore, PersistenceResult, RegistryStore};
use crate::projection::{ExperimentProjection, apply_pipeline_event, apply_task_event};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "assay_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
const RETRY_BACKOFF: Duration = Duration::from_millis(15);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(250);

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 8;

/// Registry store backed by one SQLite database (WAL journal).
///
/// Every write runs in a `BEGIN IMMEDIATE` transaction, which serializes
/// writers across threads and processes sharing the file. Busy/locked
/// errors are retried with backoff up to `retry_attempts` times before they
/// surface as [`CoreErrorKind::StoreConflict`].
pub struct SqliteStore {
    database_path: PathBuf,
    retry_attempts: u32,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    fn with_reader<T>(
        &self,
        operation_name: &str,
        operation: impl Fn(&Connection) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        self.with_retry(operation_name, || {
            let connection = open_connection(&self.database_path)
                .map_err(|error| storage_error(operation_name, error))?;
            ensure_schema_ready(&connection)
                .map_err(|error| storage_error(operation_name, error))?;
            operation(&connection)
        })
    }

    fn with_transaction<T>(
        &self,
        operation_name: &str,
        operation: impl Fn(&Transaction<'_>) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        self.with_retry(operation_name, || {
            let sql = sql_error(operation_name);
            let mut connection = open_connection(&self.database_path).map_err(&sql)?;
            ensure_schema_ready(&connection).map_err(&sql)?;
            let transaction = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(&sql)?;
            let value = operation(&transaction)?;
            transaction.commit().map_err(&sql)?;
            Ok(value)
        })
    }

    fn with_retry<T>(
        &self,
        operation_name: &str,
        mut attempt_operation: impl FnMut() -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        let mut attempt = 1;
        loop {
            match attempt_operation() {
                Err(error)
                    if error.kind == CoreErrorKind::StoreConflict
                        && attempt < self.retry_attempts =>
                {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        message = %error.message,
                        "registry store busy, retrying"
                    );
                    std::thread::sleep(backoff(attempt));
                    attempt += 1;
                }
                Err(error) if error.kind == CoreErrorKind::StoreConflict => {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt,
                        "registry store conflict persisted after retries"
                    );
                    return Err(CoreError {
                        message: format!(
                            "{} (gave up after {attempt} attempts)",
                            error.message
                        ),
                        ..error
                    });
                }
                other => return other,
            }
        }
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is all IF NOT EXISTS, so re-running it repairs a database whose
                // version row exists but whose tables were lost.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl RegistryStore for SqliteStore {
    fn create(&self, experiment: NewExperiment) -> PersistenceResult<ExperimentId> {
        let id = experiment.resolved_id();
        let location = normalize_location(&experiment.location);
        if experiment.name.trim().is_empty() || location.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::ValidationError,
                "experiment name and location must not be empty",
            )
            .experiment(&id));
        }

        let created = self.with_transaction("create", |transaction| {
            let sql = sql_error("create");
            let existing_id: Option<String> = transaction
                .query_row(
                    "SELECT experiment_id FROM experiments WHERE experiment_id = ?1 OR location = ?2",
                    params![id.as_str(), location],
                    |row| row.get(0),
                )
                .optional()
                .map_err(&sql)?;
            if let Some(existing_id) = existing_id {
                return Err(CoreError::new(
                    CoreErrorKind::AlreadyExists,
                    format!(
                        "experiment '{existing_id}' already registered for id '{id}' or location '{location}'"
                    ),
                )
                .experiment(&ExperimentId::new(existing_id)));
            }

            let now = to_i64(now_ms())?;
            transaction
                .execute(
                    "
INSERT INTO experiments (
    experiment_id, name, location, status, tags_json, metadata_json, version,
    created_at_ms, updated_at_ms
) VALUES (?1, ?2, ?3, ?4, '[]', '{}', 0, ?5, ?5)
",
                    params![
                        id.as_str(),
                        experiment.name.trim(),
                        location,
                        ExperimentStatus::Discovered.as_str(),
                        now
                    ],
                )
                .map_err(&sql)?;

            let event_type = if experiment.discovered {
                EventType::Discovered
            } else {
                EventType::Registered
            };
            let mut first = Event::new(event_type).message(format!(
                "{} '{}' at {location}",
                event_type.as_str(),
                experiment.name.trim()
            ));
            first.results = experiment.metadata.clone();
            first.tags = experiment.tags.clone();
            append_in_transaction(transaction, &id, first)?;
            Ok(id.clone())
        })?;

        tracing::info!(experiment = %created, location = %location, "registered experiment");
        Ok(created)
    }

    fn get(&self, id: &ExperimentId) -> PersistenceResult<Experiment> {
        self.with_reader("get", |connection| load_experiment(connection, id))
    }

    fn list(&self, filter: &ExperimentFilter) -> PersistenceResult<Vec<Experiment>> {
        self.with_reader("list", |connection| {
            let sql = sql_error("list");
            let mut statement = connection
                .prepare("SELECT experiment_id FROM experiments ORDER BY created_at_ms, experiment_id")
                .map_err(&sql)?;
            let ids = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(&sql)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(&sql)?;

            let mut experiments = Vec::new();
            for id in ids {
                let experiment = load_experiment(connection, &ExperimentId::new(id))?;
                if filter.matches(&experiment) {
                    experiments.push(experiment);
                }
            }
            Ok(experiments)
        })
    }

    fn append_event(&self, id: &ExperimentId, event: Event) -> PersistenceResult<AppendOutcome> {
        let event_id = event.id.clone();
        let event_type = event.event_type;
        let outcome = self.with_transaction("append_event", |transaction| {
            append_in_transaction(transaction, id, event.clone())
        })?;

        match outcome {
            AppendOutcome::Appended { seq } => tracing::debug!(
                experiment = %id,
                event = %event_id,
                event_type = event_type.as_str(),
                seq,
                "appended event"
            ),
            AppendOutcome::Duplicate => tracing::info!(
                experiment = %id,
                event = %event_id,
                "ignored duplicate event replay"
            ),
        }
        Ok(outcome)
    }

    fn events_after(
        &self,
        id: &ExperimentId,
        after_seq: u64,
    ) -> PersistenceResult<Vec<RecordedEvent>> {
        self.with_reader("events_after", |connection| {
            require_experiment(connection, id)?;
            load_events(connection, id, after_seq)
        })
    }

    fn task_list(&self, id: &ExperimentId) -> PersistenceResult<TaskList> {
        self.with_reader("task_list", |connection| {
            require_experiment(connection, id)?;
            load_task_list(connection, id)
        })
    }

    fn pipeline_run(&self, id: &ExperimentId) -> PersistenceResult<Option<PipelineRun>> {
        self.with_reader("pipeline_run", |connection| {
            require_experiment(connection, id)?;
            load_pipeline_run(connection, id)
        })
    }
}

struct ExperimentRow {
    name: String,
    location: String,
    projection: ExperimentProjection,
    version: u64,
    created_at_ms: u64,
}

fn append_in_transaction(
    transaction: &Transaction<'_>,
    id: &ExperimentId,
    event: Event,
) -> PersistenceResult<AppendOutcome> {
    let sql = sql_error("append_event");
    let row = load_experiment_row(transaction, id)?.ok_or_else(|| not_found(id))?;

    let duplicate: bool = transaction
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM experiment_events WHERE experiment_id = ?1 AND event_id = ?2)",
            params![id.as_str(), event.id.as_str()],
            |row| row.get(0),
        )
        .map_err(&sql)?;
    if duplicate {
        return Ok(AppendOutcome::Duplicate);
    }

    let attribute = |error: CoreError| error.attribute(Some(id), event.skill.as_deref(), None);

    let mut projection = row.projection;
    projection.apply(&event);

    let touches_tasks = event.event_type == EventType::TasksDefined || event.task.is_some();
    let mut tasks = load_task_list(transaction, id)?;
    if touches_tasks {
        apply_task_event(&mut tasks, &event).map_err(attribute)?;
        if event.event_type == EventType::TasksDefined {
            graph::validate_task_list(&tasks).map_err(attribute)?;
        }
    }

    let previous_run = load_pipeline_run(transaction, id)?;
    let mut run = previous_run.clone();
    apply_pipeline_event(&mut run, &event);

    let seq = row.version + 1;
    transaction
        .execute(
            "
INSERT INTO experiment_events (
    experiment_id, seq, event_id, event_type, recorded_at_ms, payload_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
            params![
                id.as_str(),
                to_i64(seq)?,
                event.id.as_str(),
                event.event_type.as_str(),
                to_i64(now_ms())?,
                encode("event", &event)?,
            ],
        )
        .map_err(&sql)?;

    let updated = transaction
        .execute(
            "
UPDATE experiments
SET status = ?2, tags_json = ?3, metadata_json = ?4, version = ?5, updated_at_ms = ?6
WHERE experiment_id = ?1 AND version = ?7
",
            params![
                id.as_str(),
                projection.status.as_str(),
                encode("tags", &projection.tags)?,
                encode("metadata", &projection.metadata)?,
                to_i64(seq)?,
                to_i64(now_ms())?,
                to_i64(row.version)?,
            ],
        )
        .map_err(&sql)?;
    if updated == 0 {
        return Err(CoreError::new(
            CoreErrorKind::StoreConflict,
            format!("experiment '{id}' version moved during append"),
        )
        .experiment(id));
    }

    if touches_tasks {
        write_task_list(transaction, id, &tasks)?;
    }
    if run != previous_run
        && let Some(run) = &run
    {
        write_pipeline_run(transaction, id, run)?;
    }

    Ok(AppendOutcome::Appended { seq })
}

fn load_experiment(connection: &Connection, id: &ExperimentId) -> PersistenceResult<Experiment> {
    let row = load_experiment_row(connection, id)?.ok_or_else(|| not_found(id))?;
    Ok(Experiment {
        id: id.clone(),
        name: row.name,
        location: row.location,
        status: row.projection.status,
        tags: row.projection.tags,
        metadata: row.projection.metadata,
        created_at_ms: row.created_at_ms,
        events: load_events(connection, id, 0)?,
    })
}

fn load_experiment_row(
    connection: &Connection,
    id: &ExperimentId,
) -> PersistenceResult<Option<ExperimentRow>> {
    let raw = connection
        .query_row(
            "
SELECT name, location, status, tags_json, metadata_json, version, created_at_ms
FROM experiments
WHERE experiment_id = ?1
",
            [id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .map_err(sql_error("load_experiment"))?;

    let Some((name, location, status_raw, tags_json, metadata_json, version, created_at)) = raw
    else {
        return Ok(None);
    };

    let status = status_raw.parse::<ExperimentStatus>().map_err(|_| {
        storage_error_text(
            "load_experiment",
            format!("unknown experiment status '{status_raw}' in persisted record for '{id}'"),
        )
    })?;
    let tags: BTreeSet<String> = decode("tags", &tags_json)?;
    let metadata: BTreeMap<String, Value> = decode("metadata", &metadata_json)?;

    Ok(Some(ExperimentRow {
        name,
        location,
        projection: ExperimentProjection {
            status,
            tags,
            metadata,
        },
        version: to_u64(version)?,
        created_at_ms: to_u64(created_at)?,
    }))
}

fn require_experiment(connection: &Connection, id: &ExperimentId) -> PersistenceResult<()> {
    let exists: bool = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM experiments WHERE experiment_id = ?1)",
            [id.as_str()],
            |row| row.get(0),
        )
        .map_err(sql_error("require_experiment"))?;
    if exists { Ok(()) } else { Err(not_found(id)) }
}

fn load_events(
    connection: &Connection,
    id: &ExperimentId,
    after_seq: u64,
) -> PersistenceResult<Vec<RecordedEvent>> {
    let sql = sql_error("load_events");
    let mut statement = connection
        .prepare(
            "
SELECT seq, payload_json
FROM experiment_events
WHERE experiment_id = ?1 AND seq > ?2
ORDER BY seq
",
        )
        .map_err(&sql)?;
    let rows = statement
        .query_map(params![id.as_str(), to_i64(after_seq)?], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(&sql)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(&sql)?;

    rows.into_iter()
        .map(|(seq, payload)| {
            Ok(RecordedEvent {
                seq: to_u64(seq)?,
                event: decode("event", &payload)?,
            })
        })
        .collect()
}

fn load_task_list(connection: &Connection, id: &ExperimentId) -> PersistenceResult<TaskList> {
    let sql = sql_error("load_task_list");
    let mut statement = connection
        .prepare(
            "
SELECT task_json
FROM experiment_tasks
WHERE experiment_id = ?1
ORDER BY position
",
        )
        .map_err(&sql)?;
    let rows = statement
        .query_map([id.as_str()], |row| row.get::<_, String>(0))
        .map_err(&sql)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(&sql)?;

    let tasks = rows
        .iter()
        .map(|payload| decode::<Task>("task", payload))
        .collect::<PersistenceResult<Vec<_>>>()?;
    Ok(TaskList { tasks })
}

fn write_task_list(
    transaction: &Transaction<'_>,
    id: &ExperimentId,
    tasks: &TaskList,
) -> PersistenceResult<()> {
    let sql = sql_error("write_task_list");
    transaction
        .execute(
            "DELETE FROM experiment_tasks WHERE experiment_id = ?1",
            [id.as_str()],
        )
        .map_err(&sql)?;

    let mut statement = transaction
        .prepare(
            "
INSERT INTO experiment_tasks (experiment_id, position, task_name, status, task_json)
VALUES (?1, ?2, ?3, ?4, ?5)
",
        )
        .map_err(&sql)?;
    for (position, task) in tasks.tasks.iter().enumerate() {
        statement
            .execute(params![
                id.as_str(),
                to_i64(position as u64)?,
                task.name.as_str(),
                task.status.as_str(),
                encode("task", task)?,
            ])
            .map_err(&sql)?;
    }
    Ok(())
}

fn load_pipeline_run(
    connection: &Connection,
    id: &ExperimentId,
) -> PersistenceResult<Option<PipelineRun>> {
    let payload: Option<String> = connection
        .query_row(
            "SELECT run_json FROM pipeline_runs WHERE experiment_id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_error("load_pipeline_run"))?;
    payload
        .map(|payload| decode("pipeline run", &payload))
        .transpose()
}

fn write_pipeline_run(
    transaction: &Transaction<'_>,
    id: &ExperimentId,
    run: &PipelineRun,
) -> PersistenceResult<()> {
    transaction
        .execute(
            "
INSERT INTO pipeline_runs (experiment_id, pipeline_name, state, next_step, run_json, updated_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(experiment_id) DO UPDATE SET
    pipeline_name = excluded.pipeline_name,
    state = excluded.state,
    next_step = excluded.next_step,
    run_json = excluded.run_json,
    updated_at_ms = excluded.updated_at_ms
",
            params![
                id.as_str(),
                run.pipeline.as_str(),
                run.state.as_str(),
                to_i64(run.next_step as u64)?,
                encode("pipeline run", run)?,
                to_i64(run.updated_at_ms)?,
            ],
        )
        .map_err(sql_error("write_pipeline_run"))?;
    Ok(())
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    connection.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "registry schema is not initialized; run migrations before using the store",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version)
        .ok_or_else(|| storage_error_sqlite(&format!("migration version '{version}' is not defined")))
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn normalize_location(location: &str) -> String {
    let trimmed = location.trim();
    if trimmed.len() > 1 {
        trimmed.trim_end_matches('/').to_string()
    } else {
        trimmed.to_string()
    }
}

fn backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(5);
    (RETRY_BACKOFF * factor).min(MAX_RETRY_BACKOFF)
}

fn encode<T: Serialize + ?Sized>(what: &str, value: &T) -> PersistenceResult<String> {
    serde_json::to_string(value).map_err(|error| {
        storage_error_text("encode", format!("failed to encode {what}: {error}"))
    })
}

fn decode<T: DeserializeOwned>(what: &str, payload: &str) -> PersistenceResult<T> {
    serde_json::from_str(payload).map_err(|error| {
        storage_error_text(
            "decode",
            format!("persisted {what} does not match the registry schema: {error}"),
        )
    })
}

fn not_found(id: &ExperimentId) -> CoreError {
    CoreError::new(CoreErrorKind::NotFound, format!("experiment '{id}' not found")).experiment(id)
}

fn sql_error(operation: &str) -> impl Fn(rusqlite::Error) -> CoreError + '_ {
    move |error| storage_error(operation, error)
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    let busy = matches!(
        &error,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    if busy {
        return CoreError::new(
            CoreErrorKind::StoreConflict,
            format!("sqlite store '{operation}' hit a concurrent writer: {error}"),
        );
    }
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

fn to_i64(value: u64) -> PersistenceResult<i64> {
    i64::try_from(value).map_err(|_| storage_error_text("convert", "value exceeds i64 range"))
}

fn to_u64(value: i64) -> PersistenceResult<u64> {
    u64::try_from(value)
        .map_err(|_| storage_error_text("convert", "negative value in persisted sqlite record"))
}
