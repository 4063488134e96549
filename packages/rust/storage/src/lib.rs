//! libSQL storage layer (local file).
//!
//! The [`Storage`] struct wraps a libSQL database holding durable run state:
//! per-entity progress, run history, the skip log, and per-sink publish state.
//! The entity records themselves live in the snapshot file, not here.
//!
//! **Access rules:**
//! - `storysync run` / `publish`: read-write via [`Storage::open`]
//! - `storysync status`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use storysync_shared::{Result, StorySyncError};
use tokio::sync::Mutex;
use uuid::Uuid;

fn storage_err(e: impl std::fmt::Display) -> StorySyncError {
    StorySyncError::Storage(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writers sharing this handle.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorySyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StorySyncError::Storage(format!(
                "no state database at {} (run `storysync run` first)",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    StorySyncError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StorySyncError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Last merged ordinal for `entity_id`, or 0 if never seen.
    pub async fn get_progress(&self, entity_id: &str) -> Result<u32> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_ordinal FROM progress WHERE entity_id = ?1",
                params![entity_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u32),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Raise the stored ordinal to `max(current, ordinal)`. Returns the stored value.
    pub async fn advance_progress(
        &self,
        entity_id: &str,
        ordinal: u32,
        strategy: &str,
    ) -> Result<u32> {
        self.check_writable()?;
        let guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO progress (entity_id, last_ordinal, strategy, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   last_ordinal = MAX(progress.last_ordinal, excluded.last_ordinal),
                   strategy = excluded.strategy,
                   updated_at = excluded.updated_at",
                params![entity_id, i64::from(ordinal), strategy, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        drop(guard);

        self.get_progress(entity_id).await
    }

    /// All progress rows, ordered by entity id.
    pub async fn list_progress(&self) -> Result<Vec<ProgressRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_id, last_ordinal, strategy, updated_at FROM progress ORDER BY entity_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(ProgressRow {
                entity_id: row.get::<String>(0).map_err(storage_err)?,
                last_ordinal: row.get::<i64>(1).map_err(storage_err)?.max(0) as u32,
                strategy: row.get::<String>(2).ok(),
                updated_at: parse_time(&row.get::<String>(3).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a run. Returns the generated run id.
    pub async fn insert_sync_run(&self) -> Result<String> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sync_runs (id, started_at) VALUES (?1, ?2)",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a run finished with its stats.
    pub async fn finish_sync_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE sync_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_sync_runs(&self, limit: u32) -> Result<Vec<SyncRunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json FROM sync_runs
                 ORDER BY started_at DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(SyncRunRow {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: parse_time(&row.get::<String>(1).map_err(storage_err)?)?,
                finished_at: row
                    .get::<String>(2)
                    .ok()
                    .map(|s| parse_time(&s))
                    .transpose()?,
                stats_json: row.get::<String>(3).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Skip log
    // -----------------------------------------------------------------------

    /// Record a skipped entity (`ordinal = None`) or unit.
    pub async fn record_skip(
        &self,
        run_id: &str,
        entity_id: &str,
        ordinal: Option<u32>,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO skips (run_id, entity_id, ordinal, kind, message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    entity_id,
                    ordinal.map(i64::from),
                    kind,
                    message,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent skips first.
    pub async fn list_skips(&self, limit: u32) -> Result<Vec<SkipRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, entity_id, ordinal, kind, message, recorded_at FROM skips
                 ORDER BY id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(SkipRow {
                run_id: row.get::<String>(0).map_err(storage_err)?,
                entity_id: row.get::<String>(1).map_err(storage_err)?,
                ordinal: row.get::<i64>(2).ok().map(|v| v.max(0) as u32),
                kind: row.get::<String>(3).map_err(storage_err)?,
                message: row.get::<String>(4).map_err(storage_err)?,
                recorded_at: parse_time(&row.get::<String>(5).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Publish state
    // -----------------------------------------------------------------------

    /// Hash of the last snapshot `sink` accepted.
    pub async fn get_publish_state(&self, sink: &str) -> Result<Option<PublishState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sink, snapshot_hash, published_at FROM publish_state WHERE sink = ?1",
                params![sink],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(PublishState {
                sink: row.get::<String>(0).map_err(storage_err)?,
                snapshot_hash: row.get::<String>(1).map_err(storage_err)?,
                published_at: parse_time(&row.get::<String>(2).map_err(storage_err)?)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Record a successful publish.
    pub async fn set_publish_state(&self, sink: &str, snapshot_hash: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO publish_state (sink, snapshot_hash, published_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(sink) DO UPDATE SET
                   snapshot_hash = excluded.snapshot_hash,
                   published_at = excluded.published_at",
                params![sink, snapshot_hash, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One row of the progress table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRow {
    pub entity_id: String,
    pub last_ordinal: u32,
    pub strategy: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded run.
#[derive(Debug, Clone)]
pub struct SyncRunRow {
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// `None` if the run never finished (crash or kill).
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
}

/// One skip log entry.
#[derive(Debug, Clone)]
pub struct SkipRow {
    pub run_id: String,
    pub entity_id: String,
    pub ordinal: Option<u32>,
    pub kind: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Last accepted snapshot per sink.
#[derive(Debug, Clone)]
pub struct PublishState {
    pub sink: String,
    pub snapshot_hash: String,
    pub published_at: DateTime<Utc>,
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorySyncError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("storysync_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("storysync_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.unwrap();
        drop(s1);
        let s2 = Storage::open(&tmp).await.unwrap();
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn progress_defaults_to_zero() {
        let storage = test_storage().await;
        assert_eq!(storage.get_progress("never-seen").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let storage = test_storage().await;
        assert_eq!(storage.advance_progress("a", 5, "explicit_links").await.unwrap(), 5);
        assert_eq!(storage.advance_progress("a", 3, "explicit_links").await.unwrap(), 5);
        assert_eq!(storage.advance_progress("a", 9, "explicit_links").await.unwrap(), 9);
        assert_eq!(storage.get_progress("a").await.unwrap(), 9);

        let rows = storage.list_progress().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strategy.as_deref(), Some("explicit_links"));
    }

    #[tokio::test]
    async fn concurrent_advances_keep_maximum() {
        let storage = Arc::new(test_storage().await);
        let mut handles = Vec::new();
        for n in 1..=20u32 {
            let s = storage.clone();
            handles.push(tokio::spawn(async move {
                s.advance_progress("shared", n, "synthesized_numeric").await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(storage.get_progress("shared").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn run_history_and_skips() {
        let storage = test_storage().await;
        let run_id = storage.insert_sync_run().await.unwrap();
        storage
            .record_skip(&run_id, "a", Some(3), "transport", "HTTP 503")
            .await
            .unwrap();
        storage
            .record_skip(&run_id, "b", None, "structure", "no title found")
            .await
            .unwrap();
        storage
            .finish_sync_run(&run_id, r#"{"entities_processed": 2}"#)
            .await
            .unwrap();

        let runs = storage.list_sync_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finished_at.is_some());

        let skips = storage.list_skips(10).await.unwrap();
        assert_eq!(skips.len(), 2);
        assert_eq!(skips[0].entity_id, "b");
        assert_eq!(skips[0].ordinal, None);
        assert_eq!(skips[1].ordinal, Some(3));
    }

    #[tokio::test]
    async fn publish_state_upserts() {
        let storage = test_storage().await;
        assert!(storage.get_publish_state("git").await.unwrap().is_none());
        storage.set_publish_state("git", "aaa").await.unwrap();
        storage.set_publish_state("git", "bbb").await.unwrap();
        let state = storage.get_publish_state("git").await.unwrap().unwrap();
        assert_eq!(state.snapshot_hash, "bbb");
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("storysync_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.advance_progress("a", 1, "explicit_links").await.is_err());
        assert_eq!(ro.get_progress("a").await.unwrap(), 0);
    }
}
