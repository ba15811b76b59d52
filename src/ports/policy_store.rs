use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ports::counter_store::StoreResult;

/// A standing block against one client IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRecord {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` together with `is_permanent` for indefinite blocks
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_permanent: bool,
    pub created_by: String,
}

impl BlockRecord {
    /// A record is in force if permanent or its expiry is still ahead of `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_permanent || self.blocked_until.is_some_and(|until| until > now)
    }

    /// Whole seconds left, rounded up; `None` for permanent blocks.
    pub fn seconds_left(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.is_permanent {
            return None;
        }
        self.blocked_until.map(|until| {
            let millis = (until - now).num_milliseconds().max(0);
            (millis + 999) / 1000
        })
    }
}

/// Input for [`PolicyStore::upsert_block`]. `blocked_at` is stamped by the store.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub ip: String,
    pub reason: String,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_permanent: bool,
    pub created_by: String,
}

/// Durable store for standing blocks and runtime tunables.
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// The block record for `ip`, active or not.
    async fn get_block(&self, ip: &str) -> StoreResult<Option<BlockRecord>>;

    /// Insert or replace the block for `block.ip`.
    async fn upsert_block(&self, block: NewBlock) -> StoreResult<BlockRecord>;

    /// Most recent blocks first.
    async fn list_blocks(&self, limit: usize) -> StoreResult<Vec<BlockRecord>>;

    /// Returns whether a record existed.
    async fn delete_block(&self, ip: &str) -> StoreResult<bool>;

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<String>>;

    /// Release connections on shutdown.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(until: Option<DateTime<Utc>>, permanent: bool) -> BlockRecord {
        BlockRecord {
            ip: "10.0.0.1".to_string(),
            reason: "test".to_string(),
            blocked_at: Utc::now(),
            blocked_until: until,
            is_permanent: permanent,
            created_by: "admin".to_string(),
        }
    }

    #[test]
    fn test_active_and_seconds_left() {
        let now = Utc::now();

        let temporary = record(Some(now + Duration::milliseconds(90_500)), false);
        assert!(temporary.is_active(now));
        assert_eq!(temporary.seconds_left(now), Some(91));

        let expired = record(Some(now - Duration::seconds(1)), false);
        assert!(!expired.is_active(now));
        assert_eq!(expired.seconds_left(now), Some(0));

        let permanent = record(None, true);
        assert!(permanent.is_active(now));
        assert_eq!(permanent.seconds_left(now), None);

        assert!(!record(None, false).is_active(now));
    }
}
