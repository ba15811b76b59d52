//! In-process [`PolicyStore`] for single-instance deployments and tests.
use async_trait::async_trait;
use chrono::Utc;
use scc::{HashMap, hash_map::Entry};

use crate::ports::{
    counter_store::StoreResult,
    policy_store::{BlockRecord, NewBlock, PolicyStore},
};

#[derive(Default)]
pub struct MemoryPolicyStore {
    blocks: HashMap<String, BlockRecord>,
    settings: HashMap<String, String>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a runtime tunable such as `max_login_attempts`.
    pub async fn set_config_value(&self, key: &str, value: &str) {
        match self.settings.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => *occupied.get_mut() = value.to_string(),
            Entry::Vacant(vacant) => {
                vacant.insert_entry(value.to_string());
            }
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_block(&self, ip: &str) -> StoreResult<Option<BlockRecord>> {
        Ok(self
            .blocks
            .get_async(ip)
            .await
            .map(|entry| entry.get().clone()))
    }

    async fn upsert_block(&self, block: NewBlock) -> StoreResult<BlockRecord> {
        let record = BlockRecord {
            ip: block.ip,
            reason: block.reason,
            blocked_at: Utc::now(),
            blocked_until: block.blocked_until,
            is_permanent: block.is_permanent,
            created_by: block.created_by,
        };
        match self.blocks.entry_async(record.ip.clone()).await {
            Entry::Occupied(mut occupied) => *occupied.get_mut() = record.clone(),
            Entry::Vacant(vacant) => {
                vacant.insert_entry(record.clone());
            }
        }
        Ok(record)
    }

    async fn list_blocks(&self, limit: usize) -> StoreResult<Vec<BlockRecord>> {
        let mut records = Vec::new();
        self.blocks
            .retain_async(|_, record| {
                records.push(record.clone());
                true
            })
            .await;
        records.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn delete_block(&self, ip: &str) -> StoreResult<bool> {
        Ok(self.blocks.remove_async(ip).await.is_some())
    }

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .settings
            .get_async(key)
            .await
            .map(|entry| entry.get().clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn block(ip: &str, reason: &str) -> NewBlock {
        NewBlock {
            ip: ip.to_string(),
            reason: reason.to_string(),
            blocked_until: Some(Utc::now() + Duration::minutes(60)),
            is_permanent: false,
            created_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_record() {
        let store = MemoryPolicyStore::new();
        store.upsert_block(block("10.0.0.1", "first")).await.unwrap();
        store.upsert_block(block("10.0.0.1", "second")).await.unwrap();

        let record = store.get_block("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.reason, "second");
        assert_eq!(store.list_blocks(100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_delete() {
        let store = MemoryPolicyStore::new();
        store.upsert_block(block("10.0.0.1", "a")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_block(block("10.0.0.2", "b")).await.unwrap();

        let listed = store.list_blocks(100).await.unwrap();
        assert_eq!(listed[0].ip, "10.0.0.2");
        assert_eq!(listed[1].ip, "10.0.0.1");
        assert_eq!(store.list_blocks(1).await.unwrap().len(), 1);

        assert!(store.delete_block("10.0.0.1").await.unwrap());
        assert!(!store.delete_block("10.0.0.1").await.unwrap());
        assert!(store.get_block("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_values() {
        let store = MemoryPolicyStore::new();
        assert_eq!(store.get_config_value("max_login_attempts").await.unwrap(), None);
        store.set_config_value("max_login_attempts", "3").await;
        assert_eq!(
            store
                .get_config_value("max_login_attempts")
                .await
                .unwrap()
                .as_deref(),
            Some("3")
        );
    }
}
