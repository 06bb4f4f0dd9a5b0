use std::future::Future;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

use crate::api::rate_limit::{is_rate_limited, Throttle};
use crate::config::Config;
use crate::error::{Error, Result};

/// Longest response body excerpt kept in logs and errors.
const MAX_LOGGED_BODY: usize = 2000;

/// A fully formed API request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Value of a query parameter, if set.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status, headers and decoded JSON body of one response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Numeric header such as `X-Total-Count`.
    pub fn header_usize(&self, name: &str) -> Option<usize> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }

    /// Decode the body into a typed payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// One attempt at sending a request over the wire.
///
/// Returns every HTTP response, successful or not; only network-level
/// failures are errors here. Classification happens in [`RequestExecutor`].
pub trait Transport: Send + Sync {
    fn send(&self, request: &ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

/// `reqwest`-backed transport carrying the auth headers.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("OAuth {}", config.token))
            .map_err(|e| Error::Config(format!("invalid token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        let org = HeaderValue::from_str(config.org_id.value())
            .map_err(|e| Error::Config(format!("invalid organisation id: {e}")))?;
        headers.insert(config.org_id.header_name(), org);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response.text().await?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) if (200..300).contains(&status) => {
                    return Err(Error::Decode(format!("{}: {e}", request.url)))
                }
                Err(_) => Value::String(text),
            }
        };

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Issues requests through a [`Transport`], throttles, classifies failures
/// and retries a rate-limited request exactly once.
pub struct RequestExecutor<T: Transport = HttpTransport> {
    transport: T,
    throttle: Throttle,
}

impl RequestExecutor<HttpTransport> {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(HttpTransport::new(config)?, Throttle::from_config(config)))
    }
}

impl<T: Transport> RequestExecutor<T> {
    pub fn new(transport: T, throttle: Throttle) -> Self {
        Self { transport, throttle }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut retried = false;
        loop {
            let outcome = self.transport.send(request).await;
            self.throttle.after_request().await;

            let response = match outcome {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("{} {} failed: {e}", request.method, request.url);
                    return Err(e);
                }
            };
            if response.is_success() {
                return Ok(response);
            }

            log_rejection(request, &response);
            if is_rate_limited(response.status) && !retried {
                retried = true;
                self.throttle.cooldown().await;
                continue;
            }
            return Err(Error::RequestFailed {
                status: response.status,
                url: request.url.clone(),
                body: excerpt(&response.body),
            });
        }
    }
}

fn log_rejection(request: &ApiRequest, response: &ApiResponse) {
    let body = excerpt(&response.body);
    let target = format!("{} {}", request.method, request.url);
    match response.status {
        400 => log::error!(
            "Malformed request (400) {target} query={:?} body={:?}: {body}",
            request.query,
            request.body
        ),
        401 | 403 => log::error!(
            "Authentication/permission denied ({}) {target}: {body}",
            response.status
        ),
        422 => log::error!("Query rejected (422) {target} body={:?}: {body}", request.body),
        429 => log::warn!("Rate limited (429) {target}: {body}"),
        s if s >= 500 => log::error!("Server error ({s}) {target}: {body}"),
        s => log::warn!("Request failed ({s}) {target}: {body}"),
    }
    log::debug!("Response headers for {target}: {:?}", response.headers);
}

fn excerpt(body: &Value) -> String {
    let text = match body {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_LOGGED_BODY {
        let cut: String = text.chars().take(MAX_LOGGED_BODY).collect();
        format!("{cut}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{throttle_off, FnTransport};
    use serde_json::json;

    #[tokio::test]
    async fn test_success_passes_through() {
        let transport = FnTransport::new(|_, _| {
            Ok(ApiResponse::new(200, json!({"ok": true})).with_header("X-Total-Count", "3"))
        });
        let executor = RequestExecutor::new(transport, throttle_off());
        let response = executor
            .execute(&ApiRequest::get("http://t/v2/issues/A-1"))
            .await
            .unwrap();
        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(response.header_usize("x-total-count"), Some(3));
        assert_eq!(executor.transport().calls(), 1);
    }

    #[tokio::test]
    async fn test_429_retried_once_then_succeeds() {
        let transport = FnTransport::new(|_, call| {
            if call == 0 {
                Ok(ApiResponse::new(429, json!({"errorMessages": ["slow down"]})))
            } else {
                Ok(ApiResponse::new(200, json!([])))
            }
        });
        let executor = RequestExecutor::new(transport, throttle_off());
        let response = executor
            .execute(&ApiRequest::get("http://t/v2/issues/A-1"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(executor.transport().calls(), 2);
    }

    #[tokio::test]
    async fn test_429_twice_propagates() {
        let transport = FnTransport::new(|_, _| Ok(ApiResponse::new(429, Value::Null)));
        let executor = RequestExecutor::new(transport, throttle_off());
        let err = executor
            .execute(&ApiRequest::get("http://t/v2/issues/A-1"))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(executor.transport().calls(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        for status in [400u16, 401, 403, 404, 422, 500, 503] {
            let transport = FnTransport::new(move |_, _| {
                Ok(ApiResponse::new(status, json!({"errors": {"query": "bad"}})))
            });
            let executor = RequestExecutor::new(transport, throttle_off());
            let err = executor
                .execute(&ApiRequest::post("http://t/v2/issues/_search", json!({})))
                .await
                .unwrap_err();
            assert_eq!(err.status(), Some(status));
            assert_eq!(executor.transport().calls(), 1, "status {status} was retried");
        }
    }

    #[tokio::test]
    async fn test_transport_failure_is_distinct() {
        let transport = FnTransport::new(|_, _| Err(Error::Transport("connection reset".into())));
        let executor = RequestExecutor::new(transport, throttle_off());
        let err = executor
            .execute(&ApiRequest::get("http://t/v2/issues/A-1"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.status(), None);
        assert_eq!(executor.transport().calls(), 1);
    }

    #[test]
    fn test_request_builder_params() {
        let req = ApiRequest::get("http://t/v2/issues/A-1/changelog")
            .query("perPage", 50)
            .query("type", "IssueWorkflow");
        assert_eq!(req.param("perPage"), Some("50"));
        assert_eq!(req.param("id"), None);
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = Value::String("x".repeat(MAX_LOGGED_BODY + 10));
        assert_eq!(excerpt(&long).len(), MAX_LOGGED_BODY + 3);
        assert_eq!(excerpt(&Value::Null), "");
    }
}
