use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::api::types::RemoteIssue;

/// Status code used when the tracker reports no status for a task.
pub const UNKNOWN_STATUS: &str = "unknown";

/// A task mirrored from the tracker, as the sync core sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Task {
    pub external_id: String,
    pub key: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub status_display: String,
    pub author: Option<String>,
    pub assignee: Option<String>,
    pub queue: Option<String>,
    pub issue_type: Option<String>,
    pub priority: Option<String>,
    /// Component names joined with ", ".
    pub components: Option<String>,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Start of the period before the first recorded transition: creation
    /// time, else last update, else `now`.
    pub fn history_origin(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.remote_created_at
            .or(self.remote_updated_at)
            .unwrap_or(now)
    }
}

impl From<&RemoteIssue> for Task {
    fn from(issue: &RemoteIssue) -> Self {
        let status = issue
            .status
            .as_ref()
            .and_then(|s| s.code())
            .unwrap_or(UNKNOWN_STATUS)
            .to_string();
        let status_display = issue
            .status
            .as_ref()
            .and_then(|s| s.label())
            .unwrap_or(&status)
            .to_string();
        let components: Vec<&str> = issue.components.iter().filter_map(|c| c.label()).collect();

        Self {
            external_id: issue.id.clone(),
            key: issue.key.clone(),
            summary: issue.summary.clone(),
            description: issue.description.clone(),
            status,
            status_display,
            author: issue.created_by.as_ref().and_then(|r| r.label()).map(str::to_string),
            assignee: issue.assignee.as_ref().and_then(|r| r.label()).map(str::to_string),
            queue: issue.queue.as_ref().and_then(|r| r.code()).map(str::to_string),
            issue_type: issue.issue_type.as_ref().and_then(|r| r.label()).map(str::to_string),
            priority: issue.priority.as_ref().and_then(|r| r.label()).map(str::to_string),
            components: if components.is_empty() {
                None
            } else {
                Some(components.join(", "))
            },
            remote_created_at: issue.created_at,
            remote_updated_at: issue.updated_at,
        }
    }
}

/// A task row with its local bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTask {
    pub id: i64,
    #[serde(flatten)]
    pub task: Task,
    pub last_changelog_id: Option<String>,
    pub last_synced_at: Option<String>,
}

/// One contiguous period during which a task held one status.
/// `end` is exclusive; `None` means the status is still current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusInterval {
    pub status: String,
    pub status_display: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl StatusInterval {
    pub fn open(status: &str, status_display: &str, start: DateTime<Utc>) -> Self {
        Self {
            status: status.to_string(),
            status_display: status_display.to_string(),
            start,
            end: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Duration up to `end`, or up to `now` for the open interval.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.end.unwrap_or(now) - self.start
    }
}

/// An interval destined for, or read from, a specific task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInterval {
    pub task_id: i64,
    #[serde(flatten)]
    pub interval: StatusInterval,
}

/// A persisted interval row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredInterval {
    pub id: i64,
    pub task_id: i64,
    #[serde(flatten)]
    pub interval: StatusInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// What the sync coordinator needs to know about a stored task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSyncState {
    pub task_id: i64,
    pub last_changelog_id: Option<String>,
    pub interval_count: usize,
}

impl TaskSyncState {
    /// Only tasks with a cursor and existing history can take the delta path.
    pub fn can_sync_incrementally(&self) -> bool {
        self.last_changelog_id.is_some() && self.interval_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// A run left in `running` by a killed process, closed by a later run.
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "abandoned" => Some(RunStatus::Abandoned),
            _ => None,
        }
    }
}

/// Audit record of one sync execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub tasks_processed: u64,
    pub tasks_created: u64,
    pub tasks_updated: u64,
    pub api_errors: u64,
    pub intervals_created: u64,
    pub error_message: Option<String>,
}
