use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use crate::{
    constants::BALANCES_CACHE_HASH_KEY,
    error::Result,
    models::{BalanceEntry, ChainRef},
};

/// Persisted balance entries keyed by `BalanceEntry::id`. Only the balances
/// aggregator writes here.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    /// Entries whose (chain, address) is part of `targets`.
    async fn load(&self, targets: &BTreeMap<ChainRef, Vec<String>>) -> Result<Vec<BalanceEntry>>;
    async fn store(&self, entries: &[BalanceEntry]) -> Result<()>;
    async fn remove(&self, ids: &[String]) -> Result<()>;
}

fn is_targeted(targets: &BTreeMap<ChainRef, Vec<String>>, entry: &BalanceEntry) -> bool {
    targets
        .get(&entry.source)
        .map(|addresses| addresses.iter().any(|a| a == &entry.address))
        .unwrap_or(false)
}

pub struct RedisBalanceCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisBalanceCache {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BalanceCache for RedisBalanceCache {
    async fn load(&self, targets: &BTreeMap<ChainRef, Vec<String>>) -> Result<Vec<BalanceEntry>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(BALANCES_CACHE_HASH_KEY).await?;

        let mut entries = Vec::new();
        for (id, json) in raw {
            match serde_json::from_str::<BalanceEntry>(&json) {
                Ok(entry) if is_targeted(targets, &entry) => entries.push(entry),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("Skipping unreadable cached balance {}: {}", id, err);
                }
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn store(&self, entries: &[BalanceEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let items = entries
            .iter()
            .map(|entry| Ok((entry.id.clone(), serde_json::to_string(entry)?)))
            .collect::<Result<Vec<(String, String)>>>()?;

        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(BALANCES_CACHE_HASH_KEY, &items).await?;
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(BALANCES_CACHE_HASH_KEY, ids).await?;
        Ok(())
    }
}

/// Process-local cache used when no Redis is configured.
#[derive(Default)]
pub struct MemoryBalanceCache {
    entries: RwLock<BTreeMap<String, BalanceEntry>>,
}

impl MemoryBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl BalanceCache for MemoryBalanceCache {
    async fn load(&self, targets: &BTreeMap<ChainRef, Vec<String>>) -> Result<Vec<BalanceEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| is_targeted(targets, entry))
            .cloned()
            .collect())
    }

    async fn store(&self, entries: &[BalanceEntry]) -> Result<()> {
        let mut guard = self.entries.write().await;
        for entry in entries {
            guard.insert(entry.id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> Result<()> {
        let mut guard = self.entries.write().await;
        for id in ids {
            guard.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BalanceModuleKind;

    fn entry(address: &str, network: &str) -> BalanceEntry {
        BalanceEntry::new(
            address,
            ChainRef::Evm(network.to_string()),
            BalanceModuleKind::EvmNative,
            "native",
            "ETH",
            18,
        )
    }

    #[tokio::test]
    async fn memory_cache_filters_by_targets() {
        let cache = MemoryBalanceCache::new();
        cache
            .store(&[entry("0xaaa", "1"), entry("0xbbb", "1"), entry("0xaaa", "137")])
            .await
            .unwrap();

        let mut targets = BTreeMap::new();
        targets.insert(ChainRef::Evm("1".to_string()), vec!["0xaaa".to_string()]);
        let loaded = cache.load(&targets).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "0xaaa-evm:1-native");
    }

    #[tokio::test]
    async fn memory_cache_removes_ids() {
        let cache = MemoryBalanceCache::new();
        let e = entry("0xaaa", "1");
        cache.store(&[e.clone()]).await.unwrap();
        cache.remove(&[e.id.clone()]).await.unwrap();
        assert_eq!(cache.len().await, 0);
    }
}
