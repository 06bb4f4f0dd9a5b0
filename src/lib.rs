pub mod api;
pub mod config;
pub mod date_util;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;
pub mod url;

use std::sync::Arc;

pub use api::executor::{HttpTransport, Transport};
pub use api::types::SearchQuery;
pub use api::TrackerClient;
pub use config::{Config, OrgId};
pub use error::{Error, Result};
pub use model::{RunStatus, StatusInterval, StoredInterval, StoredTask, SyncRun, Task};
pub use storage::{Database, StoreStatus, TaskHistory};
pub use sync::{NoopProgress, SyncOptions, SyncProgress, SyncReport};
pub use url::resolve_issue_key;

use sync::syncer;

/// `app_config` key holding the default search used by `sync`.
pub const SYNC_QUERY_KEY: &str = "sync.query";

/// Main entry point: a local store paired with a tracker client.
pub struct TrackerSync<T: Transport = HttpTransport> {
    db: Database,
    client: Arc<TrackerClient<T>>,
}

impl TrackerSync<HttpTransport> {
    pub fn from_config(db: Database, config: Config) -> Result<Self> {
        Ok(Self::new(db, TrackerClient::from_config(config)?))
    }
}

impl<T: Transport + 'static> TrackerSync<T> {
    pub fn new(db: Database, client: TrackerClient<T>) -> Self {
        Self {
            db,
            client: Arc::new(client),
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn client(&self) -> &TrackerClient<T> {
        &self.client
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        syncer::sync(&self.db, &self.client, options, progress).await
    }

    /// Search query stored under [`SYNC_QUERY_KEY`].
    pub async fn default_query(&self) -> Result<SearchQuery> {
        match self.db.config_get(SYNC_QUERY_KEY).await? {
            Some(stored) => Ok(SearchQuery::parse(&stored)),
            None => Err(Error::Config(format!(
                "no sync query given. Pass --query or run: trackersync config set {SYNC_QUERY_KEY} <QUERY>"
            ))),
        }
    }

    pub async fn sync_keys(
        &self,
        keys: &[String],
        full: bool,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        syncer::sync_keys(&self.db, &self.client, keys, full, progress).await
    }
}
