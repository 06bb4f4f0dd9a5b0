pub mod audit;
pub mod batch;
pub mod history;
pub mod incremental;
pub mod syncer;

use serde::Serialize;

use crate::api::types::SearchQuery;
use crate::model::{RunStatus, SyncRun};

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub query: SearchQuery,
    /// Stop after this many tasks. Also skips the result-size probe.
    pub limit: Option<usize>,
    /// Rebuild every task's history from its full change log.
    pub full: bool,
}

impl SyncOptions {
    pub fn new(query: SearchQuery) -> Self {
        Self {
            query,
            limit: None,
            full: false,
        }
    }
}

/// Report returned after a sync run is finalized.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub success: bool,
    pub tasks_processed: u64,
    pub tasks_created: u64,
    pub tasks_updated: u64,
    pub intervals_created: u64,
    pub api_errors: u64,
    pub error: Option<String>,
}

impl From<&SyncRun> for SyncReport {
    fn from(run: &SyncRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            success: run.status == RunStatus::Completed,
            tasks_processed: run.tasks_processed,
            tasks_created: run.tasks_created,
            tasks_updated: run.tasks_updated,
            intervals_created: run.intervals_created,
            api_errors: run.api_errors,
            error: run.error_message.clone(),
        }
    }
}

/// Callbacks for reporting sync progress. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _run_id: i64) {}

    fn on_tasks_found(&self, _count: usize) {}

    /// `stage` names the batch being fetched ("details", "changelogs").
    fn on_batch_progress(&self, _stage: &str, _done: usize, _total: usize) {}

    fn on_run_complete(&self, _report: &SyncReport) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
