//! Per-run JSONL audit trail.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::date_util::format_timestamp;
use crate::model::RunStatus;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent<'a> {
    RunStarted {
        run_id: i64,
        full: bool,
        limit: Option<usize>,
    },
    TasksFound {
        count: usize,
    },
    TaskSynced {
        key: &'a str,
        mode: &'a str,
        intervals_created: usize,
    },
    TaskFailed {
        id: &'a str,
        stage: &'a str,
        error: String,
    },
    RunFinished {
        status: RunStatus,
        tasks_processed: u64,
        intervals_created: u64,
        api_errors: u64,
        error: Option<&'a str>,
    },
}

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// Appends one JSON object per event to `sync-run-<id>.jsonl`.
///
/// Write failures are logged and disable the log; they never fail a run.
pub struct AuditLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl AuditLog {
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: None,
        }
    }

    pub fn open(dir: &Path, run_id: i64) -> Self {
        let path = dir.join(format!("sync-run-{run_id}.jsonl"));
        let opened = std::fs::create_dir_all(dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
        });
        match opened {
            Ok(file) => {
                log::info!("Writing audit log to {}", path.display());
                Self {
                    path: Some(path),
                    writer: Some(BufWriter::new(file)),
                }
            }
            Err(e) => {
                log::warn!("Cannot open audit log {}: {e}", path.display());
                Self::disabled()
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&mut self, event: AuditEvent<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = Line {
            ts: format_timestamp(&Utc::now()),
            event: &event,
        };
        let written = serde_json::to_string(&line)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                writer.write_all(json.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()
            });
        if let Err(e) = written {
            log::warn!("Audit log write failed, disabling: {e}");
            self.writer = None;
        }
    }
}
