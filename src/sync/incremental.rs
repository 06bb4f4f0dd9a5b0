//! Persisting reconstructed history, in full or as a delta past the
//! task's stored change-log cursor.
//!
//! Callers run these inside a transaction on the writer connection.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::api::types::ChangelogEntry;
use crate::model::{StatusInterval, StoredInterval, Task, TaskInterval};
use crate::storage::repository;
use crate::sync::history::{self, clamp_end, intervals_from_changes, normalize, status_changes};

fn for_task(task_id: i64, intervals: Vec<StatusInterval>) -> Vec<TaskInterval> {
    intervals
        .into_iter()
        .map(|interval| TaskInterval { task_id, interval })
        .collect()
}

/// Drop the task's stored history and write a fresh reconstruction.
/// Returns the number of intervals written.
pub fn replace_history(
    conn: &Connection,
    task_id: i64,
    task: &Task,
    changelog: &[ChangelogEntry],
) -> Result<usize, rusqlite::Error> {
    let removed = repository::delete_intervals_for_task(conn, task_id)?;
    if removed > 0 {
        log::debug!("Replacing {removed} intervals for {}", task.key);
    }
    let intervals = history::reconstruct(changelog, task);
    let created = repository::bulk_insert_intervals(conn, &for_task(task_id, intervals))?;
    repository::set_task_cursor(conn, task_id, history::newest_entry_id(changelog).as_deref())?;
    Ok(created)
}

/// Extend a task's history with change-log entries newer than its cursor.
///
/// Closes the open interval at the start of the earliest new interval,
/// appends the new ones and advances the cursor to the newest entry.
/// A task without stored intervals gets a full reconstruction instead.
/// A delta reaching back before the stored timeline is merged with it and
/// the task's rows are rewritten.
/// Returns the number of intervals created.
pub fn incremental_update(
    conn: &Connection,
    task_id: i64,
    task: &Task,
    new_changelog: &[ChangelogEntry],
) -> Result<usize, rusqlite::Error> {
    let stored = repository::list_intervals_for_task(conn, task_id)?;
    if stored.is_empty() {
        return replace_history(conn, task_id, task, new_changelog);
    }

    let state = repository::get_task_sync_state(conn, &task.external_id)?;
    let cursor = state.and_then(|s| s.last_changelog_id);
    let fresh: Vec<ChangelogEntry> = new_changelog
        .iter()
        .filter(|e| Some(&e.id) != cursor.as_ref())
        .cloned()
        .collect();

    let known: HashSet<(String, DateTime<Utc>)> = stored
        .iter()
        .map(|s| (s.interval.status.clone(), s.interval.start))
        .collect();
    let mut candidates = intervals_from_changes(&status_changes(&fresh));
    candidates.retain(|i| !known.contains(&(i.status.clone(), i.start)));
    let new_intervals = normalize(candidates);

    let timeline_end = stored
        .iter()
        .flat_map(|s| [Some(s.interval.start), s.interval.end])
        .flatten()
        .max();
    let first_start = new_intervals.first().map(|i| i.start);
    let created = match (first_start, timeline_end) {
        (Some(first), Some(boundary)) if first < boundary => {
            log::warn!(
                "{}: change at {first} precedes stored history ending {boundary}, rewriting",
                task.key
            );
            rewrite_merged(conn, task_id, stored, new_intervals)?
        }
        _ => append(conn, task_id, new_intervals)?,
    };

    if let Some(newest) = history::newest_entry_id(new_changelog) {
        repository::set_task_cursor(conn, task_id, Some(&newest))?;
    }
    log::debug!(
        "{}: {} new change-log entries, {created} intervals created",
        task.key,
        fresh.len()
    );
    Ok(created)
}

fn append(
    conn: &Connection,
    task_id: i64,
    new_intervals: Vec<StatusInterval>,
) -> Result<usize, rusqlite::Error> {
    let Some(first) = new_intervals.first() else {
        return Ok(0);
    };
    if let Some(open) = repository::open_interval_for_task(conn, task_id)? {
        let mut closed = open.interval;
        closed.end = Some(first.start);
        clamp_end(&mut closed);
        if let Some(end) = closed.end {
            repository::close_interval(conn, open.id, &end)?;
        }
    }
    repository::bulk_insert_intervals(conn, &for_task(task_id, new_intervals))
}

/// Re-chain stored and new intervals into one timeline and replace the
/// task's rows with it. Counts only intervals that were not stored before.
fn rewrite_merged(
    conn: &Connection,
    task_id: i64,
    stored: Vec<StoredInterval>,
    new_intervals: Vec<StatusInterval>,
) -> Result<usize, rusqlite::Error> {
    let created = new_intervals.len();
    let merged = normalize(
        stored
            .into_iter()
            .map(|s| s.interval)
            .chain(new_intervals)
            .collect(),
    );
    repository::delete_intervals_for_task(conn, task_id)?;
    repository::bulk_insert_intervals(conn, &for_task(task_id, merged))?;
    Ok(created)
}
