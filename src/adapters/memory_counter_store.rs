//! In-process [`CounterStore`] backed by `scc::HashMap`.
//!
//! Per-key atomicity comes from `scc`'s entry locking, so concurrent increments on one
//! key are serialized without a global lock. Expiry is evaluated lazily against the
//! tokio clock, which lets tests drive window expiry with `tokio::time::pause`.
//! State is local to the process: run a single gateway instance with this store.
use std::time::Duration;

use async_trait::async_trait;
use scc::{HashMap, hash_map::Entry};
use tokio::time::Instant;

use crate::{
    ports::counter_store::{CounterHit, CounterStore, StoreError, StoreResult},
    utils::glob_match,
};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn count(&self, key: &str) -> StoreResult<u64> {
        self.value
            .parse::<u64>()
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: format!("not a counter: {e}"),
            })
    }
}

#[derive(Default)]
pub struct MemoryCounterStore {
    entries: HashMap<String, Slot>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries
            .retain_async(|_, slot| {
                let keep = slot.is_live(now);
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        removed
    }

    async fn bump(&self, key: &str, ttl_on_create: Option<Duration>) -> StoreResult<CounterHit> {
        let now = Instant::now();
        let fresh = |count: u64| Slot {
            value: count.to_string(),
            expires_at: ttl_on_create.map(|ttl| now + ttl),
        };

        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_live(now) {
                    let count = slot.count(key)? + 1;
                    slot.value = count.to_string();
                    Ok(CounterHit {
                        count,
                        ttl: slot.ttl(now),
                    })
                } else {
                    *slot = fresh(1);
                    Ok(CounterHit {
                        count: 1,
                        ttl: ttl_on_create,
                    })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(fresh(1));
                Ok(CounterHit {
                    count: 1,
                    ttl: ttl_on_create,
                })
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get_async(key)
            .await
            .filter(|entry| entry.get().is_live(now))
            .map(|entry| entry.get().value.clone()))
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.bump(key, None).await.map(|hit| hit.count)
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<CounterHit> {
        self.bump(key, Some(ttl)).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let slot = Slot {
            value: value.to_string(),
            expires_at: Some(Instant::now() + ttl),
        };
        match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => *occupied.get_mut() = slot,
            Entry::Vacant(vacant) => {
                vacant.insert_entry(slot);
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some((_, slot)) = self.entries.remove_async(key).await {
                if slot.is_live(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn list_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut keys = Vec::new();
        self.entries
            .retain_async(|key, slot| {
                let live = slot.is_live(now);
                if live && glob_match(pattern, key) {
                    keys.push(key.clone());
                }
                live
            })
            .await;
        keys.sort();
        Ok(keys)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get_async(key)
            .await
            .filter(|entry| entry.get().is_live(now))
            .and_then(|entry| entry.get().ttl(now)))
    }
}
