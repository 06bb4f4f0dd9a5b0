use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.tracker.yandex.net";

/// The vendor caps `X-Total-Count` at this value. A probe reporting it means
/// the real result set may be larger, so bounded pagination cannot be trusted.
/// It doubles as the bounded-pagination page ceiling.
pub const VENDOR_TOTAL_COUNT_CEILING: usize = 10_000;

/// Which header carries the organisation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgId {
    /// `X-Org-ID`
    Standard(String),
    /// `X-Cloud-Org-ID`
    Cloud(String),
}

impl OrgId {
    pub fn header_name(&self) -> &'static str {
        match self {
            OrgId::Standard(_) => "x-org-id",
            OrgId::Cloud(_) => "x-cloud-org-id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            OrgId::Standard(v) | OrgId::Cloud(v) => v,
        }
    }
}

/// Connection settings and tunables for one process.
///
/// Built once and handed by reference to the request executor, the
/// paginator and the sync coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub org_id: OrgId,
    pub base_url: String,
    pub request_timeout: Duration,
    /// Sleep after every request, whatever the outcome.
    pub request_delay: Duration,
    /// Wait before the single retry of a 429 response.
    pub rate_limit_cooldown: Duration,
    pub batch_workers: usize,
    pub page_size: usize,
    pub max_pages: usize,
    pub total_count_ceiling: usize,
    pub scroll_page_size: usize,
    pub scroll_ttl_millis: u64,
    pub changelog_page_size: usize,
    pub audit_dir: Option<PathBuf>,
}

impl Config {
    pub fn new(token: impl Into<String>, org_id: OrgId) -> Self {
        Self {
            token: token.into(),
            org_id,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            request_delay: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(60),
            batch_workers: 8,
            page_size: 100,
            max_pages: VENDOR_TOTAL_COUNT_CEILING,
            total_count_ceiling: VENDOR_TOTAL_COUNT_CEILING,
            scroll_page_size: 1000,
            scroll_ttl_millis: 60_000,
            changelog_page_size: 50,
            audit_dir: None,
        }
    }

    /// Build from `TRACKER_TOKEN`, `TRACKER_ORG_ID` or `TRACKER_CLOUD_ORG_ID`,
    /// and optionally `TRACKER_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let token = non_empty_var("TRACKER_TOKEN")
            .ok_or_else(|| Error::Config("TRACKER_TOKEN is not set".into()))?;
        let org_id = match (
            non_empty_var("TRACKER_ORG_ID"),
            non_empty_var("TRACKER_CLOUD_ORG_ID"),
        ) {
            (Some(id), _) => OrgId::Standard(id),
            (None, Some(id)) => OrgId::Cloud(id),
            (None, None) => {
                return Err(Error::Config(
                    "set TRACKER_ORG_ID or TRACKER_CLOUD_ORG_ID".into(),
                ))
            }
        };
        let mut config = Self::new(token, org_id);
        if let Some(base_url) = non_empty_var("TRACKER_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_batch_workers(mut self, workers: usize) -> Self {
        self.batch_workers = workers.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    /// Absolute URL for an API path such as `/v2/issues/ABC-1`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("t", OrgId::Standard("42".into()));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.total_count_ceiling, 10_000);
        assert_eq!(config.max_pages, config.total_count_ceiling);
        assert_eq!(config.scroll_page_size, 1000);
        assert_eq!(config.changelog_page_size, 50);
    }

    #[test]
    fn test_builders_clamp_and_trim() {
        let config = Config::new("t", OrgId::Cloud("c".into()))
            .with_base_url("http://localhost:8080/")
            .with_batch_workers(0)
            .with_page_size(0);
        assert_eq!(config.url("/v2/issues/A-1"), "http://localhost:8080/v2/issues/A-1");
        assert_eq!(config.batch_workers, 1);
        assert_eq!(config.page_size, 1);
    }

    #[test]
    fn test_org_header() {
        assert_eq!(OrgId::Standard("1".into()).header_name(), "x-org-id");
        assert_eq!(OrgId::Cloud("b1g".into()).header_name(), "x-cloud-org-id");
        assert_eq!(OrgId::Cloud("b1g".into()).value(), "b1g");
    }
}
