//! Fixed-window rate limiting per client IP, backed by the shared counter store.
//!
//! Each request performs one atomic increment-with-expiry on `rate_limit:<ip>`. The
//! expiry is set only by the first increment of a window, so the window is fixed
//! (not sliding) and later hits never extend it. Requests past the limit still
//! increment the counter; this does not change when the window ends.
use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;

use crate::{
    config::models::{ServerConfig, parse_period},
    core::{error::GatewayError, store_guard::bounded},
    ports::counter_store::CounterStore,
};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Window state reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the current window ends
    pub reset_at: i64,
    pub retry_after_secs: u64,
    pub window: Duration,
}

impl RateLimitStatus {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(self.reset_at));
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u64,
    pub key_prefix: String,
    pub store_timeout: Duration,
    pub fail_closed: bool,
}

impl RateLimitSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self, String> {
        Ok(Self {
            window: parse_period("rate_limit.window", &config.rate_limit.window)?,
            max_requests: config.rate_limit.max_requests,
            key_prefix: config.rate_limit.key_prefix.clone(),
            store_timeout: parse_period("stores.timeout", &config.stores.timeout)?,
            fail_closed: config.stores.fail_closed.rate_limit,
        })
    }
}

pub struct FixedWindowRateLimiter {
    counters: Arc<dyn CounterStore>,
    settings: RateLimitSettings,
}

impl FixedWindowRateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, settings: RateLimitSettings) -> Self {
        Self { counters, settings }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Count this request against the client's window.
    ///
    /// Returns the window status on success, `Ok(None)` if the store failed and the
    /// limiter is failing open, or `RateLimited` once the limit is exceeded.
    pub async fn check(&self, ip: IpAddr) -> Result<Option<RateLimitStatus>, GatewayError> {
        let key = format!("{}{}", self.settings.key_prefix, ip);
        let hit = match bounded(
            self.settings.store_timeout,
            "increment_with_expiry",
            self.counters.increment_with_expiry(&key, self.settings.window),
        )
        .await
        {
            Ok(hit) => hit,
            Err(e) if self.settings.fail_closed => {
                tracing::error!(client_ip = %ip, error = %e, "Rate limit store failed, rejecting request");
                return Err(GatewayError::internal("Unable to evaluate rate limit", e));
            }
            Err(e) => {
                tracing::warn!(client_ip = %ip, error = %e, "Rate limit store failed, allowing request");
                return Ok(None);
            }
        };

        let ttl = hit.ttl.unwrap_or(self.settings.window);
        let retry_after_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let status = RateLimitStatus {
            limit: self.settings.max_requests,
            remaining: self.settings.max_requests.saturating_sub(hit.count),
            reset_at: Utc::now().timestamp() + i64::try_from(retry_after_secs).unwrap_or(0),
            retry_after_secs,
            window: self.settings.window,
        };

        if hit.count > self.settings.max_requests {
            tracing::warn!(
                client_ip = %ip,
                count = hit.count,
                limit = self.settings.max_requests,
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(GatewayError::RateLimited(status));
        }
        Ok(Some(status))
    }
}
