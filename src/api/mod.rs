pub mod executor;
pub mod pagination;
pub mod rate_limit;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::Config;
use crate::error::{Error, Result};

use executor::{ApiRequest, HttpTransport, RequestExecutor, Transport};
use pagination::Paginator;
use types::{ChangelogEntry, RemoteIssue, SearchQuery};

/// Typed access to the tracker endpoints the sync engine consumes.
pub struct TrackerClient<T: Transport = HttpTransport> {
    executor: RequestExecutor<T>,
    config: Config,
}

impl TrackerClient<HttpTransport> {
    pub fn from_config(config: Config) -> Result<Self> {
        let executor = RequestExecutor::from_config(&config)?;
        Ok(Self::new(executor, config))
    }
}

impl<T: Transport> TrackerClient<T> {
    pub fn new(executor: RequestExecutor<T>, config: Config) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &RequestExecutor<T> {
        &self.executor
    }

    /// A paginator borrowing this client. Cheap; create one per operation.
    pub fn paginator(&self) -> Paginator<'_, T> {
        Paginator::new(&self.executor, &self.config)
    }

    /// All issues matching `query`, capped at `limit` when given.
    pub async fn search(&self, query: &SearchQuery, limit: Option<usize>) -> Result<Vec<RemoteIssue>> {
        self.paginator().search(query, limit).await
    }

    pub async fn probe_total(&self, query: &SearchQuery) -> Result<usize> {
        self.paginator().probe_total(query).await
    }

    /// Fetch one issue by id or key.
    pub async fn get_issue(&self, id: &str) -> Result<RemoteIssue> {
        let request = ApiRequest::get(self.config.url(&format!("/v2/issues/{id}")));
        match self.executor.execute(&request).await {
            Ok(response) => response.json(),
            Err(e) if e.status() == Some(404) => Err(Error::NotFound(format!("issue {id}"))),
            Err(e) => Err(e),
        }
    }

    /// The complete status-workflow change log of an issue.
    pub async fn changelog(&self, id: &str) -> Result<Vec<ChangelogEntry>> {
        self.paginator().changelog(id, None).await
    }

    /// Change-log entries recorded after entry `cursor`.
    pub async fn changelog_since(&self, id: &str, cursor: &str) -> Result<Vec<ChangelogEntry>> {
        self.paginator().changelog(id, Some(cursor)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::ApiResponse;
    use serde_json::json;
    use testing::{test_client, test_config};

    #[tokio::test]
    async fn test_get_issue() {
        let client = test_client(test_config(), |req, _| {
            assert!(req.url.ends_with("/v2/issues/ABC-1"));
            assert_eq!(req.method, reqwest::Method::GET);
            Ok(ApiResponse::new(200, json!({"id": "x1", "key": "ABC-1"})))
        });
        let issue = client.get_issue("ABC-1").await.unwrap();
        assert_eq!(issue.id, "x1");
    }

    #[tokio::test]
    async fn test_get_issue_not_found() {
        let client = test_client(test_config(), |_, _| {
            Ok(ApiResponse::new(404, json!({"errorMessages": ["nope"]})))
        });
        let err = client.get_issue("ABC-404").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_issue_bad_payload() {
        let client = test_client(test_config(), |_, _| Ok(ApiResponse::new(200, json!([1, 2]))));
        let err = client.get_issue("ABC-1").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_search_with_limit_uses_bounded_pages() {
        let client = test_client(test_config(), |req, _| {
            assert!(req.url.ends_with("/v2/issues/_search"));
            assert_eq!(req.body, Some(json!({"query": "Queue: ABC"})));
            Ok(ApiResponse::new(
                200,
                json!([{"id": "1", "key": "ABC-1"}, {"id": "2", "key": "ABC-2"}]),
            ))
        });
        let issues = client
            .search(&SearchQuery::text("Queue: ABC"), Some(1))
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(client.executor().transport().calls(), 1);
    }

    #[tokio::test]
    async fn test_changelog_since_passes_cursor() {
        let client = test_client(test_config(), |req, _| {
            assert_eq!(req.param("id"), Some("c9"));
            Ok(ApiResponse::new(200, json!([])))
        });
        let entries = client.changelog_since("ABC-1", "c9").await.unwrap();
        assert!(entries.is_empty());
    }
}
