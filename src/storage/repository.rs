use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::date_util::{format_timestamp, parse_stored};
use crate::model::{
    RunStatus, StatusInterval, StoredInterval, StoredTask, SyncRun, Task, TaskInterval,
    TaskSyncState, UpsertOutcome,
};

// ── Tasks ──────────────────────────────────────────────────────────

/// Insert or refresh a task keyed by its external id.
/// Returns the internal id and whether the row was new.
pub fn upsert_task(conn: &Connection, task: &Task) -> Result<(i64, UpsertOutcome), rusqlite::Error> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM tasks WHERE external_id = ?1",
            params![task.external_id],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute(
        "INSERT INTO tasks (
            external_id, key, summary, description, status, status_display,
            author, assignee, queue, issue_type, priority, components,
            remote_created_at, remote_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(external_id) DO UPDATE SET
            key=excluded.key, summary=excluded.summary, description=excluded.description,
            status=excluded.status, status_display=excluded.status_display,
            author=excluded.author, assignee=excluded.assignee, queue=excluded.queue,
            issue_type=excluded.issue_type, priority=excluded.priority,
            components=excluded.components, remote_created_at=excluded.remote_created_at,
            remote_updated_at=excluded.remote_updated_at, updated_at=datetime('now')",
        params![
            task.external_id,
            task.key,
            task.summary,
            task.description,
            task.status,
            task.status_display,
            task.author,
            task.assignee,
            task.queue,
            task.issue_type,
            task.priority,
            task.components,
            task.remote_created_at.as_ref().map(format_timestamp),
            task.remote_updated_at.as_ref().map(format_timestamp),
        ],
    )?;

    Ok(match existing {
        Some(id) => (id, UpsertOutcome::Updated),
        None => (conn.last_insert_rowid(), UpsertOutcome::Created),
    })
}

const TASK_COLUMNS: &str = "id, external_id, key, summary, description, status, status_display,
    author, assignee, queue, issue_type, priority, components,
    remote_created_at, remote_updated_at, last_changelog_id, last_synced_at";

fn task_from_row(row: &Row<'_>) -> Result<StoredTask, rusqlite::Error> {
    let created: Option<String> = row.get(13)?;
    let updated: Option<String> = row.get(14)?;
    Ok(StoredTask {
        id: row.get(0)?,
        task: Task {
            external_id: row.get(1)?,
            key: row.get(2)?,
            summary: row.get(3)?,
            description: row.get(4)?,
            status: row.get(5)?,
            status_display: row.get(6)?,
            author: row.get(7)?,
            assignee: row.get(8)?,
            queue: row.get(9)?,
            issue_type: row.get(10)?,
            priority: row.get(11)?,
            components: row.get(12)?,
            remote_created_at: created.as_deref().and_then(parse_stored),
            remote_updated_at: updated.as_deref().and_then(parse_stored),
        },
        last_changelog_id: row.get(15)?,
        last_synced_at: row.get(16)?,
    })
}

pub fn find_task_by_key(conn: &Connection, key: &str) -> Result<Option<StoredTask>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE key = ?1 ORDER BY id LIMIT 1"),
        params![key],
        task_from_row,
    )
    .optional()
}

pub fn find_task_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<StoredTask>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE external_id = ?1"),
        params![external_id],
        task_from_row,
    )
    .optional()
}

/// Cursor and interval count for a task, or `None` if it was never stored.
pub fn get_task_sync_state(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<TaskSyncState>, rusqlite::Error> {
    conn.query_row(
        "SELECT t.id, t.last_changelog_id,
                (SELECT COUNT(*) FROM status_intervals si WHERE si.task_id = t.id)
         FROM tasks t WHERE t.external_id = ?1",
        params![external_id],
        |row| {
            Ok(TaskSyncState {
                task_id: row.get(0)?,
                last_changelog_id: row.get(1)?,
                interval_count: row.get::<_, i64>(2)? as usize,
            })
        },
    )
    .optional()
}

pub fn set_task_cursor(
    conn: &Connection,
    task_id: i64,
    cursor: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE tasks SET last_changelog_id = ?2 WHERE id = ?1",
        params![task_id, cursor],
    )?;
    Ok(())
}

pub fn mark_task_synced(conn: &Connection, task_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE tasks SET last_synced_at = datetime('now') WHERE id = ?1",
        params![task_id],
    )?;
    Ok(())
}

pub fn count_tasks(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get::<_, i64>(0))
        .map(|n| n as u64)
}

// ── Status intervals ───────────────────────────────────────────────

pub fn delete_intervals_for_task(conn: &Connection, task_id: i64) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM status_intervals WHERE task_id = ?1",
        params![task_id],
    )
}

/// Insert intervals, silently skipping any whose
/// `(task_id, status, start_time)` already exists. Returns rows written.
pub fn bulk_insert_intervals(
    conn: &Connection,
    intervals: &[TaskInterval],
) -> Result<usize, rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO status_intervals (task_id, status, status_display, start_time, end_time)
         SELECT ?1, ?2, ?3, ?4, ?5
         WHERE NOT EXISTS (
             SELECT 1 FROM status_intervals
             WHERE task_id = ?1 AND status = ?2 AND start_time = ?4
         )",
    )?;
    let mut created = 0;
    for row in intervals {
        let i = &row.interval;
        created += stmt.execute(params![
            row.task_id,
            i.status,
            i.status_display,
            format_timestamp(&i.start),
            i.end.as_ref().map(format_timestamp),
        ])?;
    }
    Ok(created)
}

/// Remove all but the lowest-id row of each `(task_id, status, start_time)` group.
pub fn deduplicate_intervals(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM status_intervals
         WHERE id NOT IN (
             SELECT MIN(id) FROM status_intervals
             GROUP BY task_id, status, start_time
         )",
        [],
    )
}

fn parse_column_time(idx: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn interval_from_row(row: &Row<'_>) -> Result<StoredInterval, rusqlite::Error> {
    let start: String = row.get(4)?;
    let end: Option<String> = row.get(5)?;
    Ok(StoredInterval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        interval: StatusInterval {
            status: row.get(2)?,
            status_display: row.get(3)?,
            start: parse_column_time(4, &start)?,
            end: end.as_deref().map(|e| parse_column_time(5, e)).transpose()?,
        },
    })
}

pub fn list_intervals_for_task(
    conn: &Connection,
    task_id: i64,
) -> Result<Vec<StoredInterval>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, status, status_display, start_time, end_time
         FROM status_intervals WHERE task_id = ?1
         ORDER BY start_time, id",
    )?;
    let rows = stmt.query_map(params![task_id], interval_from_row)?;
    rows.collect()
}

/// The task's current (open) interval. The latest one wins if a corrupted
/// history holds several.
pub fn open_interval_for_task(
    conn: &Connection,
    task_id: i64,
) -> Result<Option<StoredInterval>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, task_id, status, status_display, start_time, end_time
         FROM status_intervals WHERE task_id = ?1 AND end_time IS NULL
         ORDER BY start_time DESC, id DESC LIMIT 1",
        params![task_id],
        interval_from_row,
    )
    .optional()
}

pub fn close_interval(
    conn: &Connection,
    interval_id: i64,
    end: &DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE status_intervals SET end_time = ?2 WHERE id = ?1",
        params![interval_id, format_timestamp(end)],
    )?;
    Ok(())
}

pub fn count_intervals(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM status_intervals", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as u64)
}

// ── Sync runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(conn: &Connection, started_at: &DateTime<Utc>) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (started_at, status) VALUES (?1, 'running')",
        params![format_timestamp(started_at)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Persist the counters, status, finish time and error of a run.
pub fn update_sync_run(conn: &Connection, run: &SyncRun) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, finished_at = ?3,
            tasks_processed = ?4, tasks_created = ?5, tasks_updated = ?6,
            api_errors = ?7, intervals_created = ?8, error_message = ?9
         WHERE id = ?1",
        params![
            run.id,
            run.status.as_str(),
            run.finished_at,
            run.tasks_processed as i64,
            run.tasks_created as i64,
            run.tasks_updated as i64,
            run.api_errors as i64,
            run.intervals_created as i64,
            run.error_message,
        ],
    )?;
    Ok(())
}

/// Close out runs left `running` by an interrupted process.
pub fn mark_abandoned_runs(conn: &Connection, now: &DateTime<Utc>) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = 'abandoned', finished_at = ?1,
            error_message = COALESCE(error_message, 'interrupted before completion')
         WHERE status = 'running'",
        params![format_timestamp(now)],
    )
}

fn sync_run_from_row(row: &Row<'_>) -> Result<SyncRun, rusqlite::Error> {
    let status: String = row.get(3)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown sync run status: {status}").into(),
        )
    })?;
    Ok(SyncRun {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status,
        tasks_processed: row.get::<_, i64>(4)? as u64,
        tasks_created: row.get::<_, i64>(5)? as u64,
        tasks_updated: row.get::<_, i64>(6)? as u64,
        api_errors: row.get::<_, i64>(7)? as u64,
        intervals_created: row.get::<_, i64>(8)? as u64,
        error_message: row.get(9)?,
    })
}

const SYNC_RUN_COLUMNS: &str = "id, started_at, finished_at, status, tasks_processed,
    tasks_created, tasks_updated, api_errors, intervals_created, error_message";

pub fn get_sync_run(conn: &Connection, id: i64) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
        params![id],
        sync_run_from_row,
    )
    .optional()
}

/// Most recent runs first.
pub fn recent_sync_runs(conn: &Connection, limit: usize) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs ORDER BY id DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit as i64], sync_run_from_row)?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}
