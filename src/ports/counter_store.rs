use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by the counter/cache store and the policy store.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store rejected the operation or could not be reached
    #[error("Store backend error: {0}")]
    Backend(String),

    /// The operation did not complete within the configured bound
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A stored value could not be interpreted
    #[error("Corrupt value under '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an atomic increment-with-expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Counter value after the increment
    pub count: u64,
    /// Time left before the counter expires, if it has an expiry
    pub ttl: Option<Duration>,
}

/// Key/value store with expiry holding rate-window counters, escalation
/// counters and cached responses. Shared by every gateway instance.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Increment without touching expiry; a missing key starts at 1 with none.
    async fn increment(&self, key: &str) -> StoreResult<u64>;

    /// Atomically increment `key` and, only when this created it, set its
    /// expiry to `ttl`. Concurrent callers never lose an increment and the
    /// window is never extended by later hits.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterHit>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete all `keys` in one batch, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn list_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Remaining lifetime; `None` when the key is missing or never expires.
    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>>;
}

/// Counter store doubles for exercising store outages.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Every call either fails immediately or never completes.
    pub(crate) struct UnavailableCounterStore {
        hang: bool,
    }

    impl UnavailableCounterStore {
        pub(crate) fn failing() -> Self {
            Self { hang: false }
        }

        pub(crate) fn hanging() -> Self {
            Self { hang: true }
        }

        async fn outage<T>(&self) -> StoreResult<T> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl CounterStore for UnavailableCounterStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            self.outage().await
        }
        async fn increment(&self, _key: &str) -> StoreResult<u64> {
            self.outage().await
        }
        async fn increment_with_expiry(&self, _key: &str, _ttl: Duration) -> StoreResult<CounterHit> {
            self.outage().await
        }
        async fn set_with_expiry(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
            self.outage().await
        }
        async fn delete(&self, _keys: &[String]) -> StoreResult<u64> {
            self.outage().await
        }
        async fn list_keys(&self, _pattern: &str) -> StoreResult<Vec<String>> {
            self.outage().await
        }
        async fn ttl_remaining(&self, _key: &str) -> StoreResult<Option<Duration>> {
            self.outage().await
        }
    }
}
