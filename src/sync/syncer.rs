use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::api::executor::Transport;
use crate::api::types::{ChangelogEntry, RemoteIssue};
use crate::api::TrackerClient;
use crate::date_util::format_timestamp;
use crate::error::{Error, Result};
use crate::model::{RunStatus, SyncRun, Task, UpsertOutcome};
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::audit::{AuditEvent, AuditLog};
use crate::sync::batch::fetch_batch;
use crate::sync::incremental::{incremental_update, replace_history};
use crate::sync::{SyncOptions, SyncProgress, SyncReport};
use crate::url::resolve_issue_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryMode {
    Full,
    Incremental,
}

impl HistoryMode {
    fn as_str(self) -> &'static str {
        match self {
            HistoryMode::Full => "full",
            HistoryMode::Incremental => "incremental",
        }
    }

    fn stage(self) -> &'static str {
        match self {
            HistoryMode::Full => "changelogs",
            HistoryMode::Incremental => "changelog updates",
        }
    }
}

struct PlannedTask {
    task_id: i64,
    task: Task,
    mode: HistoryMode,
    cursor: Option<String>,
}

/// A sync run in progress. Consumed by [`Run::finish`], so the stored
/// record is finalized once.
struct Run<'a> {
    db: &'a Database,
    record: SyncRun,
    audit: AuditLog,
}

impl<'a> Run<'a> {
    async fn start(db: &'a Database, audit_dir: Option<&Path>) -> Result<Self> {
        let now = Utc::now();
        let (id, abandoned) = db
            .writer()
            .call(move |conn| {
                let abandoned = repository::mark_abandoned_runs(conn, &now)?;
                let id = repository::insert_sync_run(conn, &now)?;
                Ok::<_, rusqlite::Error>((id, abandoned))
            })
            .await?;
        if abandoned > 0 {
            log::warn!("Marked {abandoned} interrupted sync run(s) as abandoned");
        }
        log::info!("Started sync run {id}");

        let audit = match audit_dir {
            Some(dir) => AuditLog::open(dir, id),
            None => AuditLog::disabled(),
        };
        Ok(Self {
            db,
            record: SyncRun {
                id,
                started_at: format_timestamp(&now),
                finished_at: None,
                status: RunStatus::Running,
                tasks_processed: 0,
                tasks_created: 0,
                tasks_updated: 0,
                api_errors: 0,
                intervals_created: 0,
                error_message: None,
            },
            audit,
        })
    }

    /// Persist the current counters.
    async fn save(&self) -> Result<()> {
        let record = self.record.clone();
        self.db
            .writer()
            .call(move |conn| repository::update_sync_run(conn, &record))
            .await?;
        Ok(())
    }

    async fn finish(mut self, outcome: Result<()>) -> Result<SyncReport> {
        match outcome {
            Ok(()) => self.record.status = RunStatus::Completed,
            Err(e) => {
                log::error!("Sync run {} failed: {e}", self.record.id);
                self.record.status = RunStatus::Failed;
                self.record.error_message = Some(e.to_string());
            }
        }
        self.record.finished_at = Some(format_timestamp(&Utc::now()));
        self.save().await?;

        let r = &self.record;
        self.audit.record(AuditEvent::RunFinished {
            status: r.status,
            tasks_processed: r.tasks_processed,
            intervals_created: r.intervals_created,
            api_errors: r.api_errors,
            error: r.error_message.as_deref(),
        });
        log::info!(
            "Sync run {} {}: {} tasks ({} new, {} updated), {} intervals, {} API errors",
            r.id,
            r.status.as_str(),
            r.tasks_processed,
            r.tasks_created,
            r.tasks_updated,
            r.intervals_created,
            r.api_errors
        );
        Ok(SyncReport::from(&self.record))
    }
}

/// Sync every task matching `options.query`.
///
/// Failures inside the run are recorded on the run and reported through
/// `SyncReport::success`; `Err` means the run itself could not be recorded.
pub async fn sync<T: Transport + 'static>(
    db: &Database,
    client: &Arc<TrackerClient<T>>,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    let mut run = Run::start(db, client.config().audit_dir.as_deref()).await?;
    progress.on_run_start(run.record.id);
    run.audit.record(AuditEvent::RunStarted {
        run_id: run.record.id,
        full: options.full,
        limit: options.limit,
    });

    let outcome = sync_search(&mut run, client, options, progress).await;
    let report = run.finish(outcome).await?;
    progress.on_run_complete(&report);
    Ok(report)
}

/// Sync an explicit list of tasks, given as keys or tracker URLs.
pub async fn sync_keys<T: Transport + 'static>(
    db: &Database,
    client: &Arc<TrackerClient<T>>,
    keys: &[String],
    full: bool,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    let mut run = Run::start(db, client.config().audit_dir.as_deref()).await?;
    progress.on_run_start(run.record.id);
    run.audit.record(AuditEvent::RunStarted {
        run_id: run.record.id,
        full,
        limit: None,
    });

    let outcome = sync_key_list(&mut run, client, keys, full, progress).await;
    let report = run.finish(outcome).await?;
    progress.on_run_complete(&report);
    Ok(report)
}

async fn sync_search<T: Transport + 'static>(
    run: &mut Run<'_>,
    client: &Arc<TrackerClient<T>>,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> Result<()> {
    let issues: Vec<RemoteIssue> = match client.search(&options.query, options.limit).await {
        Ok(issues) => issues,
        Err(e) => {
            run.record.api_errors += 1;
            return Err(e);
        }
    };
    process_issues(run, client, issues, options.full, progress).await
}

async fn sync_key_list<T: Transport + 'static>(
    run: &mut Run<'_>,
    client: &Arc<TrackerClient<T>>,
    keys: &[String],
    full: bool,
    progress: &dyn SyncProgress,
) -> Result<()> {
    let keys = keys
        .iter()
        .map(|k| resolve_issue_key(k))
        .collect::<Result<Vec<_>>>()?;

    let workers = client.config().batch_workers;
    let fetched = fetch_batch(
        &keys,
        workers,
        {
            let client = Arc::clone(client);
            move |key: String| {
                let client = Arc::clone(&client);
                async move { client.get_issue(&key).await }
            }
        },
        |done, total| progress.on_batch_progress("details", done, total),
    )
    .await;

    run.record.api_errors += fetched.failures as u64;
    if let Some(e) = fetched.fatal {
        return Err(e);
    }

    let mut issues = Vec::with_capacity(fetched.items.len());
    for (key, issue) in fetched.items {
        match issue {
            Some(issue) => issues.push(issue),
            None => run.audit.record(AuditEvent::TaskFailed {
                id: &key,
                stage: "details",
                error: "task detail fetch failed".into(),
            }),
        }
    }
    process_issues(run, client, issues, full, progress).await
}

async fn process_issues<T: Transport + 'static>(
    run: &mut Run<'_>,
    client: &Arc<TrackerClient<T>>,
    issues: Vec<RemoteIssue>,
    full: bool,
    progress: &dyn SyncProgress,
) -> Result<()> {
    let issues = unique_issues(issues);
    if issues.is_empty() {
        return Err(Error::NotFound("no tasks to sync".into()));
    }
    log::info!("Syncing {} tasks", issues.len());
    progress.on_tasks_found(issues.len());
    run.audit.record(AuditEvent::TasksFound {
        count: issues.len(),
    });

    let planned = upsert_tasks(run, issues, full).await?;
    run.save().await?;

    let (full_group, incremental_group): (Vec<_>, Vec<_>) = planned
        .into_iter()
        .partition(|p| p.mode == HistoryMode::Full);
    log::info!(
        "{} tasks need full history, {} incremental",
        full_group.len(),
        incremental_group.len()
    );

    sync_histories(run, client, full_group, HistoryMode::Full, progress).await?;
    sync_histories(run, client, incremental_group, HistoryMode::Incremental, progress).await?;
    Ok(())
}

/// Drop repeated issues (scroll pages may overlap), keeping first sightings.
fn unique_issues(issues: Vec<RemoteIssue>) -> Vec<RemoteIssue> {
    let mut seen = HashSet::new();
    issues
        .into_iter()
        .filter(|issue| seen.insert(issue.id.clone()))
        .collect()
}

async fn upsert_tasks(
    run: &mut Run<'_>,
    issues: Vec<RemoteIssue>,
    full: bool,
) -> Result<Vec<PlannedTask>> {
    let tasks: Vec<Task> = issues.iter().map(Task::from).collect();
    let upserted = run
        .db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut out = Vec::with_capacity(tasks.len());
            for task in tasks {
                let (task_id, outcome) = repository::upsert_task(&tx, &task)?;
                let state = repository::get_task_sync_state(&tx, &task.external_id)?;
                out.push((task, task_id, outcome, state));
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(out)
        })
        .await?;

    let mut planned = Vec::with_capacity(upserted.len());
    for (task, task_id, outcome, state) in upserted {
        match outcome {
            UpsertOutcome::Created => run.record.tasks_created += 1,
            UpsertOutcome::Updated => run.record.tasks_updated += 1,
        }
        let incremental = !full && state.as_ref().is_some_and(|s| s.can_sync_incrementally());
        planned.push(PlannedTask {
            task_id,
            task,
            mode: if incremental {
                HistoryMode::Incremental
            } else {
                HistoryMode::Full
            },
            cursor: state.and_then(|s| s.last_changelog_id),
        });
    }
    Ok(planned)
}

/// Fetch change logs for one group concurrently, then persist each task's
/// history sequentially on the writer.
async fn sync_histories<T: Transport + 'static>(
    run: &mut Run<'_>,
    client: &Arc<TrackerClient<T>>,
    group: Vec<PlannedTask>,
    mode: HistoryMode,
    progress: &dyn SyncProgress,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }
    let keys: Vec<String> = group.iter().map(|p| p.task.key.clone()).collect();
    let cursors: Arc<HashMap<String, String>> = Arc::new(
        group
            .iter()
            .filter(|p| p.mode == HistoryMode::Incremental)
            .filter_map(|p| Some((p.task.key.clone(), p.cursor.clone()?)))
            .collect(),
    );

    let workers = client.config().batch_workers;
    let stage = mode.stage();
    let fetched = fetch_batch(
        &keys,
        workers,
        {
            let client = Arc::clone(client);
            move |key: String| {
                let client = Arc::clone(&client);
                let cursor = cursors.get(&key).cloned();
                async move {
                    match cursor {
                        Some(cursor) => client.changelog_since(&key, &cursor).await,
                        None => client.changelog(&key).await,
                    }
                }
            }
        },
        |done, total| progress.on_batch_progress(stage, done, total),
    )
    .await;

    run.record.api_errors += fetched.failures as u64;
    if let Some(e) = fetched.fatal {
        return Err(e);
    }

    for (planned, (key, changelog)) in group.into_iter().zip(fetched.items) {
        run.record.tasks_processed += 1;
        let Some(changelog) = changelog else {
            run.audit.record(AuditEvent::TaskFailed {
                id: &key,
                stage,
                error: "change log fetch failed".into(),
            });
            continue;
        };
        let created = persist_history(run.db, planned, changelog).await?;
        run.record.intervals_created += created as u64;
        run.audit.record(AuditEvent::TaskSynced {
            key: &key,
            mode: mode.as_str(),
            intervals_created: created,
        });
    }
    run.save().await
}

async fn persist_history(
    db: &Database,
    planned: PlannedTask,
    changelog: Vec<ChangelogEntry>,
) -> Result<usize> {
    let task_key = planned.task.key.clone();
    db.writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let created = match planned.mode {
                HistoryMode::Full => {
                    replace_history(&tx, planned.task_id, &planned.task, &changelog)?
                }
                HistoryMode::Incremental => {
                    incremental_update(&tx, planned.task_id, &planned.task, &changelog)?
                }
            };
            repository::mark_task_synced(&tx, planned.task_id)?;
            tx.commit()?;
            Ok::<_, rusqlite::Error>(created)
        })
        .await
        .map_err(|e| Error::Sync {
            task_key,
            message: e.to_string(),
        })
}
