pub mod repository;

use std::path::{Path, PathBuf};

use rusqlite_migration::{Migrations, M};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{StoredInterval, StoredTask, SyncRun};

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode. Writes are serialized through the writer's channel; the
/// sync coordinator is its only writer during a run.
///
/// Connections close when the last clone is dropped.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

/// Default database location: `~/.trackersync/trackersync.db`.
pub fn default_path() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
        .join(".trackersync");
    Ok(dir.join("trackersync.db"))
}

impl Database {
    /// Open the database at the default path, creating its directory.
    pub async fn open() -> Result<Self> {
        let path = default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::Config(e.to_string()))?;
        }
        Self::open_at(path).await
    }

    /// Open the database at the given path.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        log::debug!("Opening database at {}", path.display());

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_reader(&reader).await?;

        Ok(Self { writer, reader })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // In-memory databases are per-connection, so both roles share one.
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            migrations().to_latest(conn).map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }

    // ── Local reads and maintenance ────────────────────────────────

    /// A stored task with its intervals in chronological order.
    pub async fn task_history(&self, key: &str) -> Result<Option<TaskHistory>> {
        let key = key.to_string();
        let history = self
            .reader
            .call(move |conn| {
                let Some(task) = repository::find_task_by_key(conn, &key)? else {
                    return Ok(None);
                };
                let intervals = repository::list_intervals_for_task(conn, task.id)?;
                Ok::<_, rusqlite::Error>(Some(TaskHistory { task, intervals }))
            })
            .await?;
        Ok(history)
    }

    /// Remove duplicate `(task, status, start)` intervals. Returns the
    /// number of rows deleted.
    pub async fn deduplicate_intervals(&self) -> Result<usize> {
        let removed = self
            .writer
            .call(|conn| repository::deduplicate_intervals(conn))
            .await?;
        if removed > 0 {
            log::info!("Removed {removed} duplicate intervals");
        }
        Ok(removed)
    }

    pub async fn status(&self, recent_runs: usize) -> Result<StoreStatus> {
        let status = self
            .reader
            .call(move |conn| {
                Ok::<_, rusqlite::Error>(StoreStatus {
                    tasks: repository::count_tasks(conn)?,
                    intervals: repository::count_intervals(conn)?,
                    recent_runs: repository::recent_sync_runs(conn, recent_runs)?,
                })
            })
            .await?;
        Ok(status)
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let value = self
            .reader
            .call(move |conn| repository::get_config(conn, &key))
            .await?;
        Ok(value)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.writer
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let items = self
            .reader
            .call(|conn| repository::list_config(conn))
            .await?;
        Ok(items)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskHistory {
    pub task: StoredTask,
    pub intervals: Vec<StoredInterval>,
}

/// Row counts and the latest sync runs, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub tasks: u64,
    pub intervals: u64,
    pub recent_runs: Vec<SyncRun>,
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        for table in ["tasks", "status_intervals", "sync_runs", "app_config"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[tokio::test]
    async fn test_open_at_file_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let db = Database::open_at(&path).await.unwrap();
        db.writer()
            .call(|conn| repository::set_config(conn, "sync.query", "Queue: OPS"))
            .await
            .unwrap();
        drop(db);

        let db = Database::open_at(&path).await.unwrap();
        let value = db
            .reader()
            .call(|conn| repository::get_config(conn, "sync.query"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("Queue: OPS"));
    }

    #[tokio::test]
    async fn test_config_helpers() {
        let db = Database::open_memory().await.unwrap();
        assert_eq!(db.config_get("sync.query").await.unwrap(), None);
        db.config_set("sync.query", "Queue: ABC").await.unwrap();
        db.config_set("sync.query", "Queue: DEF").await.unwrap();
        assert_eq!(
            db.config_get("sync.query").await.unwrap().as_deref(),
            Some("Queue: DEF")
        );
        assert_eq!(db.config_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_history_and_status() {
        use crate::model::{StatusInterval, Task, TaskInterval};
        use chrono::{TimeZone, Utc};

        let db = Database::open_memory().await.unwrap();
        assert!(db.task_history("ABC-1").await.unwrap().is_none());

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        db.writer()
            .call(move |conn| {
                let task = Task {
                    external_id: "ext-1".into(),
                    key: "ABC-1".into(),
                    status: "open".into(),
                    status_display: "Open".into(),
                    ..Default::default()
                };
                let (task_id, _) = repository::upsert_task(conn, &task)?;
                let row = TaskInterval {
                    task_id,
                    interval: StatusInterval::open("open", "Open", start),
                };
                repository::bulk_insert_intervals(conn, &[row])?;
                // A second row with the same triple, as an older build could leave.
                conn.execute(
                    "INSERT INTO status_intervals (task_id, status, status_display, start_time)
                     SELECT task_id, status, status_display, start_time FROM status_intervals",
                    [],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .unwrap();

        let status = db.status(5).await.unwrap();
        assert_eq!((status.tasks, status.intervals), (1, 2));
        assert!(status.recent_runs.is_empty());

        assert_eq!(db.deduplicate_intervals().await.unwrap(), 1);
        assert_eq!(db.deduplicate_intervals().await.unwrap(), 0);

        let history = db.task_history("ABC-1").await.unwrap().unwrap();
        assert_eq!(history.task.task.key, "ABC-1");
        assert_eq!(history.intervals.len(), 1);
        assert!(history.intervals[0].interval.is_open());
    }
}
