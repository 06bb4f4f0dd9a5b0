use serde::de::DeserializeOwned;

use crate::api::executor::{ApiRequest, RequestExecutor, Transport};
use crate::api::types::SearchQuery;
use crate::config::Config;
use crate::error::{Error, Result};

pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";
pub const TOTAL_PAGES_HEADER: &str = "X-Total-Pages";
pub const SCROLL_ID_HEADER: &str = "X-Scroll-Id";
pub const LINK_HEADER: &str = "Link";

const BOUNDED_SEARCH_PATH: &str = "/v2/issues/_search";
const SCROLL_SEARCH_PATH: &str = "/v3/issues/_search";

/// How a search result set is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStrategy {
    /// Numbered pages until `target` items are collected.
    Bounded { target: usize },
    /// Server-side scroll cursor, optionally stopping after `limit` items.
    Scroll { limit: Option<usize> },
}

impl PaginationStrategy {
    /// Strategy for a probed total. A total at the vendor ceiling may be
    /// truncated, so it is treated as unknown.
    pub fn for_total(total: usize, ceiling: usize) -> Self {
        if total >= ceiling {
            PaginationStrategy::Scroll { limit: None }
        } else {
            PaginationStrategy::Bounded { target: total }
        }
    }

    /// Strategy for an explicit caller limit; no probe needed.
    pub fn for_limit(limit: usize, ceiling: usize) -> Self {
        if limit >= ceiling {
            PaginationStrategy::Scroll { limit: Some(limit) }
        } else {
            PaginationStrategy::Bounded { target: limit }
        }
    }
}

/// Walks paginated search results.
///
/// Holds no pagination state of its own: page numbers and scroll ids live
/// in each call, so concurrent sessions over one paginator never share a
/// cursor.
pub struct Paginator<'a, T: Transport> {
    executor: &'a RequestExecutor<T>,
    config: &'a Config,
}

impl<'a, T: Transport> Paginator<'a, T> {
    pub fn new(executor: &'a RequestExecutor<T>, config: &'a Config) -> Self {
        Self { executor, config }
    }

    /// Fetch every item matching `query`, up to `limit` if given.
    pub async fn search<R: DeserializeOwned>(
        &self,
        query: &SearchQuery,
        limit: Option<usize>,
    ) -> Result<Vec<R>> {
        match self.select_strategy(query, limit).await {
            PaginationStrategy::Bounded { target } => self.fetch_bounded(query, target).await,
            PaginationStrategy::Scroll { limit } => self.fetch_scroll(query, limit).await,
        }
    }

    /// Decide between bounded and scroll pagination.
    pub async fn select_strategy(
        &self,
        query: &SearchQuery,
        limit: Option<usize>,
    ) -> PaginationStrategy {
        let ceiling = self.config.total_count_ceiling;
        if let Some(limit) = limit {
            return PaginationStrategy::for_limit(limit, ceiling);
        }
        match self.probe_total(query).await {
            Ok(total) => {
                let strategy = PaginationStrategy::for_total(total, ceiling);
                log::info!("Search probe reported {total} matches, using {strategy:?}");
                strategy
            }
            Err(e) => {
                log::warn!("Search probe failed, falling back to scroll pagination: {e}");
                PaginationStrategy::Scroll { limit: None }
            }
        }
    }

    /// Read the vendor's total match count with a one-item request.
    pub async fn probe_total(&self, query: &SearchQuery) -> Result<usize> {
        let request = ApiRequest::post(
            self.config.url(BOUNDED_SEARCH_PATH),
            serde_json::to_value(query)?,
        )
        .query("page", 1)
        .query("perPage", 1);
        let response = self.executor.execute(&request).await?;
        response.header_usize(TOTAL_COUNT_HEADER).ok_or_else(|| {
            Error::Decode(format!("probe response has no {TOTAL_COUNT_HEADER} header"))
        })
    }

    pub async fn fetch_bounded<R: DeserializeOwned>(
        &self,
        query: &SearchQuery,
        target: usize,
    ) -> Result<Vec<R>> {
        let mut items: Vec<R> = Vec::new();
        if target == 0 {
            return Ok(items);
        }
        let body = serde_json::to_value(query)?;
        let mut page: usize = 1;
        loop {
            let request = ApiRequest::post(self.config.url(BOUNDED_SEARCH_PATH), body.clone())
                .query("page", page)
                .query("perPage", self.config.page_size);
            let response = self.executor.execute(&request).await?;
            let batch: Vec<R> = response.json()?;
            if batch.is_empty() {
                break;
            }
            items.extend(batch);
            log::debug!("Bounded page {page}: {} of {target} items", items.len());

            if items.len() >= target {
                items.truncate(target);
                break;
            }
            if let Some(total_pages) = response.header_usize(TOTAL_PAGES_HEADER) {
                if page >= total_pages {
                    break;
                }
            }
            if page >= self.config.max_pages {
                log::warn!(
                    "Stopped bounded pagination at the {}-page ceiling with {} items",
                    self.config.max_pages,
                    items.len()
                );
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    pub async fn fetch_scroll<R: DeserializeOwned>(
        &self,
        query: &SearchQuery,
        limit: Option<usize>,
    ) -> Result<Vec<R>> {
        let mut items: Vec<R> = Vec::new();
        let body = serde_json::to_value(query)?;
        let url = self.config.url(SCROLL_SEARCH_PATH);
        let ttl = self.config.scroll_ttl_millis;

        let mut scroll_id: Option<String> = None;
        let mut pages: usize = 0;
        loop {
            let request = match scroll_id.as_deref() {
                None => ApiRequest::post(url.clone(), body.clone())
                    .query("scrollType", "unsorted")
                    .query("perScroll", self.config.scroll_page_size)
                    .query("scrollTTLMillis", ttl),
                Some(id) => ApiRequest::post(url.clone(), body.clone())
                    .query("scrollId", id)
                    .query("scrollTTLMillis", ttl),
            };
            let response = self.executor.execute(&request).await?;
            pages += 1;
            let batch: Vec<R> = response.json()?;
            if batch.is_empty() {
                break;
            }
            items.extend(batch);
            log::debug!("Scroll page {pages}: {} items so far", items.len());

            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    break;
                }
            }
            match response.header(SCROLL_ID_HEADER) {
                Some(next) if !next.is_empty() => scroll_id = Some(next.to_string()),
                _ => break,
            }
            if pages >= self.config.max_pages {
                log::warn!(
                    "Stopped scroll pagination at the {}-page ceiling with {} items",
                    self.config.max_pages,
                    items.len()
                );
                break;
            }
        }
        Ok(items)
    }

    /// Walk a change log following `Link: <...>; rel="next"`.
    ///
    /// With `after` set, only entries after that entry id are requested.
    pub async fn changelog<R: DeserializeOwned>(
        &self,
        issue: &str,
        after: Option<&str>,
    ) -> Result<Vec<R>> {
        let url = self.config.url(&format!("/v2/issues/{issue}/changelog"));
        let mut entries: Vec<R> = Vec::new();
        let mut cursor: Option<String> = after.map(str::to_string);
        let mut pages: usize = 0;
        loop {
            let mut request = ApiRequest::get(url.clone())
                .query("perPage", self.config.changelog_page_size)
                .query("type", "IssueWorkflow");
            if let Some(ref id) = cursor {
                request = request.query("id", id);
            }
            let response = self.executor.execute(&request).await?;
            pages += 1;
            let batch: Vec<R> = response.json()?;
            if batch.is_empty() {
                break;
            }
            entries.extend(batch);

            let next = response
                .header(LINK_HEADER)
                .and_then(crate::url::next_link_id);
            match next {
                Some(id) if cursor.as_deref() != Some(id.as_str()) => cursor = Some(id),
                Some(id) => {
                    log::warn!("Changelog for {issue} repeated cursor {id}, stopping");
                    break;
                }
                None => break,
            }
            if pages >= self.config.max_pages {
                log::warn!("Stopped changelog pagination for {issue} at the page ceiling");
                break;
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::executor::ApiResponse;
    use crate::api::testing::{test_config, throttle_off, FnTransport};
    use crate::api::types::{ChangelogEntry, RemoteIssue};
    use serde_json::{json, Value};

    fn issues(range: std::ops::Range<usize>) -> Value {
        Value::Array(
            range
                .map(|i| json!({"id": format!("id{i}"), "key": format!("A-{i}")}))
                .collect(),
        )
    }

    fn executor<F>(handler: F) -> RequestExecutor<FnTransport>
    where
        F: Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync + 'static,
    {
        RequestExecutor::new(FnTransport::new(handler), throttle_off())
    }

    #[test]
    fn test_strategy_at_ceiling_is_scroll() {
        assert_eq!(
            PaginationStrategy::for_total(10_000, 10_000),
            PaginationStrategy::Scroll { limit: None }
        );
        assert_eq!(
            PaginationStrategy::for_total(9_999, 10_000),
            PaginationStrategy::Bounded { target: 9_999 }
        );
        assert_eq!(
            PaginationStrategy::for_limit(20_000, 10_000),
            PaginationStrategy::Scroll { limit: Some(20_000) }
        );
        assert_eq!(
            PaginationStrategy::for_limit(50, 10_000),
            PaginationStrategy::Bounded { target: 50 }
        );
    }

    #[tokio::test]
    async fn test_select_strategy_from_probe() {
        let config = test_config();
        for (total, expected) in [
            ("10000", PaginationStrategy::Scroll { limit: None }),
            ("9999", PaginationStrategy::Bounded { target: 9999 }),
        ] {
            let exec = executor(move |req, _| {
                assert_eq!(req.param("perPage"), Some("1"));
                Ok(ApiResponse::new(200, issues(0..1)).with_header(TOTAL_COUNT_HEADER, total))
            });
            let paginator = Paginator::new(&exec, &config);
            let strategy = paginator
                .select_strategy(&SearchQuery::text("Queue: A"), None)
                .await;
            assert_eq!(strategy, expected);
        }
    }

    #[tokio::test]
    async fn test_probe_failure_defaults_to_scroll() {
        let config = test_config();
        let exec = executor(|_, _| Ok(ApiResponse::new(500, Value::Null)));
        let paginator = Paginator::new(&exec, &config);
        let strategy = paginator.select_strategy(&SearchQuery::text("x"), None).await;
        assert_eq!(strategy, PaginationStrategy::Scroll { limit: None });
    }

    #[tokio::test]
    async fn test_explicit_limit_skips_probe() {
        let config = test_config();
        let exec = executor(|_, _| Ok(ApiResponse::new(200, issues(0..1))));
        let paginator = Paginator::new(&exec, &config);
        let strategy = paginator
            .select_strategy(&SearchQuery::text("x"), Some(25))
            .await;
        assert_eq!(strategy, PaginationStrategy::Bounded { target: 25 });
        assert_eq!(exec.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_bounded_stops_at_target() {
        let config = test_config().with_page_size(10);
        let exec = executor(|req, _| {
            let page: usize = req.param("page").unwrap().parse().unwrap();
            let start = (page - 1) * 10;
            Ok(ApiResponse::new(200, issues(start..start + 10))
                .with_header(TOTAL_PAGES_HEADER, "5"))
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_bounded(&SearchQuery::text("x"), 25)
            .await
            .unwrap();
        assert_eq!(items.len(), 25);
        assert_eq!(items[24].key, "A-24");
        assert_eq!(exec.transport().calls(), 3);
    }

    #[tokio::test]
    async fn test_bounded_stops_at_last_page_and_empty_page() {
        let config = test_config().with_page_size(10);
        let exec = executor(|req, _| {
            let page: usize = req.param("page").unwrap().parse().unwrap();
            let body = if page == 1 { issues(0..10) } else { issues(10..14) };
            Ok(ApiResponse::new(200, body).with_header(TOTAL_PAGES_HEADER, "2"))
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_bounded(&SearchQuery::text("x"), 100)
            .await
            .unwrap();
        assert_eq!(items.len(), 14);
        assert_eq!(exec.transport().calls(), 2);

        let exec = executor(|req, _| {
            let page: usize = req.param("page").unwrap().parse().unwrap();
            let body = if page == 1 { issues(0..10) } else { json!([]) };
            Ok(ApiResponse::new(200, body))
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_bounded(&SearchQuery::text("x"), 100)
            .await
            .unwrap();
        assert_eq!(items.len(), 10);
        assert_eq!(exec.transport().calls(), 2);
    }

    #[tokio::test]
    async fn test_bounded_page_ceiling() {
        let mut config = test_config().with_page_size(1);
        config.max_pages = 3;
        let exec = executor(|req, _| {
            let page: usize = req.param("page").unwrap().parse().unwrap();
            Ok(ApiResponse::new(200, issues(page..page + 1)))
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_bounded(&SearchQuery::text("x"), 100)
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn test_scroll_follows_cursor_until_missing() {
        let config = test_config();
        let exec = executor(|req, call| {
            match call {
                0 => {
                    assert_eq!(req.param("scrollType"), Some("unsorted"));
                    assert_eq!(req.param("perScroll"), Some("1000"));
                    assert_eq!(req.param("scrollId"), None);
                    Ok(ApiResponse::new(200, issues(0..3)).with_header(SCROLL_ID_HEADER, "s1"))
                }
                1 => {
                    assert_eq!(req.param("scrollId"), Some("s1"));
                    assert_eq!(req.param("scrollType"), None);
                    assert_eq!(req.param("scrollTTLMillis"), Some("60000"));
                    Ok(ApiResponse::new(200, issues(3..5)).with_header(SCROLL_ID_HEADER, "s2"))
                }
                _ => {
                    assert_eq!(req.param("scrollId"), Some("s2"));
                    Ok(ApiResponse::new(200, issues(5..6)))
                }
            }
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_scroll(&SearchQuery::text("x"), None)
            .await
            .unwrap();
        assert_eq!(items.len(), 6);
        assert_eq!(exec.transport().calls(), 3);
    }

    #[tokio::test]
    async fn test_scroll_stops_on_empty_page_and_limit() {
        let config = test_config();
        let exec = executor(|req, _| match req.param("scrollId") {
            None => Ok(ApiResponse::new(200, issues(0..3)).with_header(SCROLL_ID_HEADER, "s1")),
            Some("s1") => {
                Ok(ApiResponse::new(200, issues(3..6)).with_header(SCROLL_ID_HEADER, "s2"))
            }
            Some(_) => Ok(ApiResponse::new(200, json!([])).with_header(SCROLL_ID_HEADER, "s3")),
        });
        let paginator = Paginator::new(&exec, &config);
        let items: Vec<RemoteIssue> = paginator
            .fetch_scroll(&SearchQuery::text("x"), None)
            .await
            .unwrap();
        assert_eq!(items.len(), 6);
        assert_eq!(exec.transport().calls(), 3);

        let limited: Vec<RemoteIssue> = paginator
            .fetch_scroll(&SearchQuery::text("x"), Some(4))
            .await
            .unwrap();
        assert_eq!(limited.len(), 4);
        assert_eq!(exec.transport().calls(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_scroll_sessions_keep_separate_cursors() {
        let config = test_config();
        // Each session's cursor encodes its query, so a mixed-up cursor would
        // fetch the wrong session's second page.
        let exec = executor(|req, _| {
            let query = req.body.as_ref().unwrap()["query"].as_str().unwrap().to_string();
            match req.param("scrollId") {
                None => Ok(ApiResponse::new(200, json!([{"id": format!("{query}-1"), "key": "K-1"}]))
                    .with_header(SCROLL_ID_HEADER, &format!("cursor-{query}"))),
                Some(id) => {
                    assert_eq!(id, format!("cursor-{query}"));
                    Ok(ApiResponse::new(200, json!([{"id": format!("{query}-2"), "key": "K-2"}])))
                }
            }
        });
        let paginator = Paginator::new(&exec, &config);
        let qa = SearchQuery::text("a");
        let qb = SearchQuery::text("b");
        let (a, b) = tokio::join!(
            paginator.fetch_scroll::<RemoteIssue>(&qa, None),
            paginator.fetch_scroll::<RemoteIssue>(&qb, None),
        );
        let a: Vec<String> = a.unwrap().into_iter().map(|i| i.id).collect();
        let b: Vec<String> = b.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(a, vec!["a-1", "a-2"]);
        assert_eq!(b, vec!["b-1", "b-2"]);
    }

    #[tokio::test]
    async fn test_changelog_follows_link_header() {
        let config = test_config();
        let exec = executor(|req, _| {
            assert_eq!(req.param("type"), Some("IssueWorkflow"));
            assert_eq!(req.param("perPage"), Some("50"));
            match req.param("id") {
                None => Ok(ApiResponse::new(
                    200,
                    json!([{"id": "e1", "fields": []}, {"id": "e2", "fields": []}]),
                )
                .with_header(
                    LINK_HEADER,
                    r#"<http://tracker.test/v2/issues/A-1/changelog?id=e2&perPage=50>; rel="next""#,
                )),
                Some("e2") => Ok(ApiResponse::new(200, json!([{"id": "e3", "fields": []}]))),
                Some(other) => panic!("unexpected cursor {other}"),
            }
        });
        let paginator = Paginator::new(&exec, &config);
        let entries: Vec<ChangelogEntry> = paginator.changelog("A-1", None).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert!(exec.transport().requests()[0].url.ends_with("/v2/issues/A-1/changelog"));
    }

    #[tokio::test]
    async fn test_changelog_since_cursor_and_stuck_link() {
        let config = test_config();
        let exec = executor(|req, _| {
            assert_eq!(req.param("id"), Some("e7"));
            Ok(ApiResponse::new(200, json!([{"id": "e8", "fields": []}])).with_header(
                LINK_HEADER,
                r#"<http://tracker.test/v2/issues/A-1/changelog?id=e7>; rel="next""#,
            ))
        });
        let paginator = Paginator::new(&exec, &config);
        let entries: Vec<ChangelogEntry> = paginator.changelog("A-1", Some("e7")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(exec.transport().calls(), 1);
    }
}
