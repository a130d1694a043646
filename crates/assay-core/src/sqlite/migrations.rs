#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_registry_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS experiments (
    experiment_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    location TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    tags_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    version INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS experiment_events (
    experiment_id TEXT NOT NULL REFERENCES experiments (experiment_id),
    seq INTEGER NOT NULL,
    event_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    recorded_at_ms INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    PRIMARY KEY (experiment_id, seq),
    UNIQUE (experiment_id, event_id)
);

CREATE TABLE IF NOT EXISTS experiment_tasks (
    experiment_id TEXT NOT NULL REFERENCES experiments (experiment_id),
    position INTEGER NOT NULL,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL,
    task_json TEXT NOT NULL,
    PRIMARY KEY (experiment_id, task_name)
);

CREATE INDEX IF NOT EXISTS idx_experiment_tasks_position
    ON experiment_tasks (experiment_id, position);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_experiment_tasks_position;
DROP TABLE IF EXISTS experiment_tasks;
DROP TABLE IF EXISTS experiment_events;
DROP TABLE IF EXISTS experiments;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_pipeline_runs",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    experiment_id TEXT PRIMARY KEY REFERENCES experiments (experiment_id),
    pipeline_name TEXT NOT NULL,
    state TEXT NOT NULL,
    next_step INTEGER NOT NULL,
    run_json TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS pipeline_runs;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
