use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha3::{Digest, Keccak256};

use crate::models::ChainRef;

/// Stable hash of a normalized target set. Identical targets from different
/// callers map to the same key and therefore share one upstream hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn derive(targets: &BTreeMap<ChainRef, Vec<String>>) -> Self {
        let mut hasher = Keccak256::new();
        for (chain, addresses) in targets {
            hasher.update(chain.to_string().as_bytes());
            hasher.update(b"=");
            for address in addresses {
                hasher.update(address.as_bytes());
                hasher.update(b",");
            }
            hasher.update(b";");
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Stops whatever upstream work a shared handle owns.
pub trait Teardown {
    fn teardown(&self);
}

struct Shared<H> {
    handle: H,
    subscribers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub active_keys: usize,
    pub subscribers: usize,
    pub opened: u64,
    pub torn_down: u64,
}

/// Reference-counted map of upstream handles.
///
/// The first `acquire` for a key creates the handle; the `release` that drops
/// the count to zero removes it and calls `Teardown` exactly once.
pub struct SubscriptionManager<H> {
    entries: Mutex<HashMap<SubscriptionKey, Shared<H>>>,
    opened: AtomicU64,
    torn_down: AtomicU64,
}

impl<H> Default for SubscriptionManager<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
            torn_down: AtomicU64::new(0),
        }
    }
}

impl<H: Clone + Teardown> SubscriptionManager<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Shared<H>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the handle for `key` and whether this call created it.
    pub fn acquire<F>(&self, key: &SubscriptionKey, create: F) -> (H, bool)
    where
        F: FnOnce() -> H,
    {
        let mut entries = self.lock();
        if let Some(shared) = entries.get_mut(key) {
            shared.subscribers += 1;
            return (shared.handle.clone(), false);
        }

        let handle = create();
        entries.insert(
            key.clone(),
            Shared {
                handle: handle.clone(),
                subscribers: 1,
            },
        );
        self.opened.fetch_add(1, Ordering::Relaxed);
        (handle, true)
    }

    /// Drops one reference. Returns true when this call tore the handle down.
    pub fn release(&self, key: &SubscriptionKey) -> bool {
        let removed = {
            let mut entries = self.lock();
            let Some(shared) = entries.get_mut(key) else {
                tracing::warn!("Release for unknown subscription {}", key);
                return false;
            };
            shared.subscribers = shared.subscribers.saturating_sub(1);
            if shared.subscribers > 0 {
                return false;
            }
            entries.remove(key)
        };

        match removed {
            Some(shared) => {
                shared.handle.teardown();
                self.torn_down.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.lock().get(key).map(|s| s.subscribers).unwrap_or(0)
    }

    pub fn stats(&self) -> ManagerStats {
        let entries = self.lock();
        ManagerStats {
            active_keys: entries.len(),
            subscribers: entries.values().map(|s| s.subscribers).sum(),
            opened: self.opened.load(Ordering::Relaxed),
            torn_down: self.torn_down.load(Ordering::Relaxed),
        }
    }
}
