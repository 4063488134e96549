//! SQL migration definitions for the storysync state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: progress, sync_runs, skips, publish_state",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Last merged unit ordinal per entity; never decreases
CREATE TABLE IF NOT EXISTS progress (
    entity_id    TEXT PRIMARY KEY,
    last_ordinal INTEGER NOT NULL DEFAULT 0,
    strategy     TEXT,
    updated_at   TEXT NOT NULL
);

-- Run history
CREATE TABLE IF NOT EXISTS sync_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

-- Entities and units skipped during a run
CREATE TABLE IF NOT EXISTS skips (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
    entity_id   TEXT NOT NULL,
    ordinal     INTEGER,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_skips_run ON skips(run_id);
CREATE INDEX IF NOT EXISTS idx_skips_entity ON skips(entity_id);

-- Hash of the last snapshot each sink accepted
CREATE TABLE IF NOT EXISTS publish_state (
    sink          TEXT PRIMARY KEY,
    snapshot_hash TEXT NOT NULL,
    published_at  TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
