//! Scripted transport used by the API and sync tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::executor::{ApiRequest, ApiResponse, RequestExecutor, Transport};
use crate::api::rate_limit::Throttle;
use crate::api::TrackerClient;
use crate::config::{Config, OrgId};
use crate::error::Result;

type Handler = dyn Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync;

/// Answers each request with a closure of `(request, call_index)`.
pub struct FnTransport {
    handler: Box<Handler>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FnTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for FnTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request, call)
    }
}

pub fn throttle_off() -> Throttle {
    Throttle::new(Duration::ZERO, Duration::ZERO)
}

pub fn test_config() -> Config {
    Config::new("test-token", OrgId::Standard("1".into()))
        .with_base_url("http://tracker.test")
        .with_request_delay(Duration::ZERO)
        .with_rate_limit_cooldown(Duration::ZERO)
}

pub fn test_client<F>(config: Config, handler: F) -> TrackerClient<FnTransport>
where
    F: Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync + 'static,
{
    let executor = RequestExecutor::new(FnTransport::new(handler), throttle_off());
    TrackerClient::new(executor, config)
}
