use std::time::Duration;

use crate::config::Config;

/// HTTP status the vendor uses for rate limiting.
pub const RATE_LIMIT_STATUS: u16 = 429;

/// Fixed-delay throttle shared by every request a client issues.
///
/// No exponential backoff: one politeness sleep after each call, and one
/// cooldown before the single retry of a rate-limited call.
#[derive(Debug, Clone)]
pub struct Throttle {
    delay: Duration,
    cooldown: Duration,
}

impl Throttle {
    pub fn new(delay: Duration, cooldown: Duration) -> Self {
        Self { delay, cooldown }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_delay, config.rate_limit_cooldown)
    }

    /// Sleep after a request, regardless of its outcome.
    pub async fn after_request(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Sleep before retrying a 429.
    pub async fn cooldown(&self) {
        log::warn!(
            "Rate limited (429). Waiting {}s before a single retry",
            self.cooldown.as_secs_f32()
        );
        if !self.cooldown.is_zero() {
            tokio::time::sleep(self.cooldown).await;
        }
    }
}

pub fn is_rate_limited(status: u16) -> bool {
    status == RATE_LIMIT_STATUS
}
