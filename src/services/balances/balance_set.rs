use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::models::{
    AggregateStatus, BalanceEntry, BalanceModuleKind, BalanceStatus, BalancesUpdate, ChainRef,
};

/// The slice of a subscription one upstream unit owns. A `reset` only ever
/// replaces its own partition.
pub type PartitionKey = (ChainRef, BalanceModuleKind);

/// Ids touched since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub reset: bool,
    pub upserted: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.upserted.is_empty() && self.deleted.is_empty()
    }
}

/// Union of every partition's entries for one subscription.
#[derive(Debug, Default)]
pub struct BalanceSet {
    entries: BTreeMap<String, BalanceEntry>,
    partitions: HashMap<PartitionKey, BTreeSet<String>>,
    // Partitions that delivered a full snapshot; the cache no longer speaks for them.
    snapshotted: HashSet<PartitionKey>,
    degraded: HashSet<ChainRef>,
    changes: Changes,
}

impl BalanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, partition: &PartitionKey, update: BalancesUpdate) {
        match update {
            BalancesUpdate::Reset { balances } => {
                let incoming: BTreeSet<&str> = balances.iter().map(|e| e.id.as_str()).collect();
                let dropped: Vec<String> = self
                    .partitions
                    .get(partition)
                    .map(|ids| {
                        ids.iter()
                            .filter(|id| !incoming.contains(id.as_str()))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for id in dropped {
                    self.remove(partition, &id);
                }
                for entry in balances {
                    self.upsert(partition, entry);
                }
                self.snapshotted.insert(partition.clone());
                self.changes.reset = true;
            }
            BalancesUpdate::Upsert { balances } => {
                for entry in balances {
                    self.upsert(partition, entry);
                }
            }
            BalancesUpdate::Delete { balance_ids } => {
                for id in balance_ids {
                    self.remove(partition, &id);
                }
            }
        }
    }

    fn upsert(&mut self, partition: &PartitionKey, entry: BalanceEntry) {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .insert(entry.id.clone());
        if self.entries.get(&entry.id) == Some(&entry) {
            return;
        }
        self.changes.deleted.remove(&entry.id);
        self.changes.upserted.insert(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, partition: &PartitionKey, id: &str) {
        if let Some(ids) = self.partitions.get_mut(partition) {
            ids.remove(id);
        }
        if self.entries.remove(id).is_some() {
            self.changes.upserted.remove(id);
            self.changes.deleted.insert(id.to_string());
        }
    }

    /// Seeds entries from the persisted cache. Ids already known are left
    /// alone, and so is every partition that already delivered a snapshot:
    /// whatever that snapshot left out is gone upstream.
    pub fn warm(&mut self, cached: Vec<BalanceEntry>) {
        for mut entry in cached {
            let partition = (entry.source.clone(), entry.module);
            if self.entries.contains_key(&entry.id) || self.snapshotted.contains(&partition) {
                continue;
            }
            if self.degraded.contains(&entry.source) {
                entry.status = BalanceStatus::Stale;
            }
            self.upsert(&partition, entry);
        }
    }

    /// Flags every entry of `partition` as stale after a failed round.
    pub fn mark_partition_stale(&mut self, partition: &PartitionKey) {
        let ids: Vec<String> = self
            .partitions
            .get(partition)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            self.mark_stale(&id);
        }
    }

    fn mark_stale(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.status != BalanceStatus::Stale {
                entry.status = BalanceStatus::Stale;
                self.changes.upserted.insert(id.to_string());
            }
        }
    }

    /// Records the connector's view of `chain`. Entering backoff marks its
    /// entries stale; leaving it does not make them live again, only fresh
    /// data does. Returns true when the flag changed.
    pub fn set_chain_degraded(&mut self, chain: &ChainRef, degraded: bool) -> bool {
        if !degraded {
            return self.degraded.remove(chain);
        }
        if !self.degraded.insert(chain.clone()) {
            return false;
        }
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|entry| &entry.source == chain)
            .map(|entry| entry.id.clone())
            .collect();
        for id in ids {
            self.mark_stale(&id);
        }
        true
    }

    pub fn status(&self) -> AggregateStatus {
        let any_stale = !self.degraded.is_empty()
            || self
                .entries
                .values()
                .any(|entry| entry.status == BalanceStatus::Stale);
        if any_stale {
            return AggregateStatus::Stale;
        }
        if self
            .entries
            .values()
            .any(|entry| entry.status == BalanceStatus::Cache)
        {
            return AggregateStatus::Fetching;
        }
        AggregateStatus::Live
    }

    pub fn entries(&self) -> Vec<BalanceEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&BalanceEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }
}
