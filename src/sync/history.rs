//! Status-history reconstruction.
//!
//! Turns a task's workflow change log into an ordered list of
//! non-overlapping [`StatusInterval`]s, including the interval the task
//! sat in before its first recorded transition.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::api::types::ChangelogEntry;
use crate::model::{StatusInterval, Task};

/// One qualifying status transition pulled out of the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub entry_id: String,
    pub at: DateTime<Utc>,
    pub status: String,
    pub status_display: String,
    /// Status before the transition, when the entry records one.
    pub previous: Option<(String, String)>,
}

/// Extract status transitions, stable-sorted by timestamp.
///
/// Entries without a status field change, without a target status, or
/// without a timestamp are skipped.
pub fn status_changes(changelog: &[ChangelogEntry]) -> Vec<StatusChange> {
    let mut changes: Vec<StatusChange> = changelog
        .iter()
        .filter_map(|entry| {
            let change = entry.status_change()?;
            let to = change.to.as_ref()?;
            let status = to.code()?.to_string();
            let Some(at) = entry.updated_at else {
                log::warn!(
                    "Skipping status change in entry {} without a timestamp",
                    entry.id
                );
                return None;
            };
            let previous = change.from.as_ref().and_then(|from| {
                let code = from.code()?;
                Some((code.to_string(), from.label().unwrap_or(code).to_string()))
            });
            Some(StatusChange {
                entry_id: entry.id.clone(),
                at,
                status_display: to.label().unwrap_or(&status).to_string(),
                status,
                previous,
            })
        })
        .collect();
    changes.sort_by_key(|c| c.at);
    changes
}

/// Reconstruct the full status history of `task` as of now.
pub fn reconstruct(changelog: &[ChangelogEntry], task: &Task) -> Vec<StatusInterval> {
    reconstruct_at(changelog, task, Utc::now())
}

/// Reconstruct the full status history of `task`, using `now` as the
/// start of last resort when the task carries no timestamps.
pub fn reconstruct_at(
    changelog: &[ChangelogEntry],
    task: &Task,
    now: DateTime<Utc>,
) -> Vec<StatusInterval> {
    let changes = status_changes(changelog);
    let origin = task.history_origin(now);

    let Some(first) = changes.first() else {
        return vec![StatusInterval::open(&task.status, &task.status_display, origin)];
    };

    let (status, display) = first
        .previous
        .clone()
        .unwrap_or_else(|| (task.status.clone(), task.status_display.clone()));

    let start = if origin > first.at {
        log::warn!(
            "Task {} origin {} is after its first status change at {}; collapsing leading interval",
            task.key,
            origin,
            first.at
        );
        first.at
    } else {
        origin
    };

    let mut candidates = Vec::with_capacity(changes.len() + 1);
    candidates.push(StatusInterval::open(&status, &display, start));
    candidates.extend(intervals_from_changes(&changes));
    normalize(candidates)
}

/// One open candidate interval per change, in the order given.
pub fn intervals_from_changes(changes: &[StatusChange]) -> Vec<StatusInterval> {
    changes
        .iter()
        .map(|c| StatusInterval::open(&c.status, &c.status_display, c.at))
        .collect()
}

/// Sort by start, drop repeated `(status, start)` pairs, then chain end
/// times. The last interval stays open.
///
/// Duplicates go before chaining, so a dropped duplicate never leaves a
/// gap in the chain. Once sorted, each end is the next start and cannot
/// precede its own start; the clamp only guards that invariant.
pub fn normalize(mut intervals: Vec<StatusInterval>) -> Vec<StatusInterval> {
    intervals.sort_by_key(|i| i.start);

    let mut seen = HashSet::new();
    intervals.retain(|i| seen.insert((i.status.clone(), i.start)));

    let starts: Vec<DateTime<Utc>> = intervals.iter().map(|i| i.start).collect();
    for (i, interval) in intervals.iter_mut().enumerate() {
        interval.end = starts.get(i + 1).copied();
        clamp_end(interval);
    }
    intervals
}

/// Raise an end time that precedes its start to zero duration.
pub fn clamp_end(interval: &mut StatusInterval) {
    if let Some(end) = interval.end {
        if end < interval.start {
            log::warn!(
                "Clamping inverted {} interval: end {} before start {}",
                interval.status,
                end,
                interval.start
            );
            interval.end = Some(interval.start);
        }
    }
}

/// The entry id a cursor should advance to: the newest entry by
/// timestamp, later fetch position winning ties. Entries without a
/// timestamp only count when none have one.
pub fn newest_entry_id(changelog: &[ChangelogEntry]) -> Option<String> {
    changelog
        .iter()
        .enumerate()
        .max_by_key(|(pos, e)| (e.updated_at, *pos))
        .map(|(_, e)| e.id.clone())
}
