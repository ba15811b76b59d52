//! Redis-backed [`CounterStore`] shared by every gateway instance.
//!
//! Uses a `ConnectionManager`, which reconnects on its own and is cheap to clone
//! per call. Increment-with-expiry runs as one Lua script so the increment and the
//! first-write expiry can never be split by a concurrent request.
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, RedisError, Script, aio::ConnectionManager};

use crate::ports::counter_store::{CounterHit, CounterStore, StoreError, StoreResult};

const INCREMENT_WITH_EXPIRY: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('PTTL', KEYS[1])}
";

const SCAN_BATCH: usize = 200;

fn backend_error(e: RedisError) -> StoreError {
    StoreError::Backend(format!("redis: {e}"))
}

/// PTTL returns -1 (no expiry) or -2 (missing) instead of a duration.
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    increment_script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis. Supports both `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_error)?;
        tracing::info!("Connected to Redis counter store");
        Ok(Self {
            conn,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(backend_error)
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await.map_err(backend_error)?;
        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            message: format!("negative counter {count}"),
        })
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterHit> {
        let mut conn = self.conn.clone();
        let (count, pttl): (i64, i64) = self
            .increment_script
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;

        let count = u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            message: format!("negative counter {count}"),
        })?;
        Ok(CounterHit {
            count,
            ttl: pttl_to_duration(pttl),
        })
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(key, value, ttl_millis(ttl))
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del(keys).await.map_err(backend_error)
    }

    async fn list_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = conn.pttl(key).await.map_err(backend_error)?;
        Ok(pttl_to_duration(pttl))
    }
}
