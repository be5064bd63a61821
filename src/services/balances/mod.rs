//! Balances aggregator.
//!
//! `subscribe` turns a declarative target set into a stream of
//! `BalancesUpdate`s. Identical target sets share one hub: the hub owns one
//! polling unit per (chain, balance module), one health watcher per chain,
//! and the merged `BalanceSet` every subscriber sees.

pub mod balance_set;
pub mod debounce;
pub mod modules;
pub mod subscription;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    cache::BalanceCache,
    config::Config,
    db::ConnectionMetaStore,
    error::Result,
    models::{
        AggregateStatus, BalanceEntry, BalanceStatus, BalancesParams, BalancesUpdate, ChainRef,
    },
    services::chain_connector::{ChainConnector, ChainHealth},
};

use balance_set::{BalanceSet, PartitionKey};
use debounce::Debouncer;
use modules::{BalanceModule, ModuleRegistry, StateQuery};
use subscription::{ManagerStats, SubscriptionKey, SubscriptionManager, Teardown};

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    pub debounce: Duration,
    pub poll_interval: Duration,
}

impl AggregatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.balances_debounce(),
            poll_interval: config.balances_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainHealthReport {
    pub chain: String,
    pub health: ChainHealth,
}

// ==================== HUB ====================

enum UnitEvent {
    Update {
        partition: PartitionKey,
        update: BalancesUpdate,
    },
    Failed {
        partition: PartitionKey,
    },
    Health {
        chain: ChainRef,
        health: ChainHealth,
    },
    Warm {
        entries: Vec<BalanceEntry>,
    },
}

struct HubState {
    set: BalanceSet,
    subscribers: Vec<(u64, mpsc::UnboundedSender<BalancesUpdate>)>,
    flushed_once: bool,
}

struct HubShared {
    key: SubscriptionKey,
    state: Mutex<HubState>,
    status: watch::Sender<AggregateStatus>,
}

// Cache writes produced by one flush.
struct Persist {
    store: Vec<BalanceEntry>,
    remove: Vec<String>,
}

impl HubShared {
    // Nothing has been fetched or warmed yet, so the set starts out fetching.
    fn new(key: SubscriptionKey) -> Self {
        let (status, _) = watch::channel(AggregateStatus::Fetching);
        Self {
            key,
            state: Mutex::new(HubState {
                set: BalanceSet::new(),
                subscribers: Vec::new(),
                flushed_once: false,
            }),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one upstream event. Returns true when a flush is needed.
    fn apply(&self, event: UnitEvent) -> bool {
        let mut state = self.lock();
        match event {
            UnitEvent::Update { partition, update } => state.set.apply(&partition, update),
            UnitEvent::Failed { partition } => state.set.mark_partition_stale(&partition),
            UnitEvent::Health { chain, health } => {
                state.set.set_chain_degraded(&chain, health.is_degraded());
            }
            UnitEvent::Warm { entries } => {
                state.set.warm(entries);
                // The warm snapshot is the first thing a consumer sees, even
                // when the cache was empty.
                return true;
            }
        }
        state.set.has_changes() || state.set.status() != *self.status.borrow()
    }

    fn flush(&self) -> Option<Persist> {
        let mut state = self.lock();
        let changes = state.set.take_changes();
        let status = state.set.status();
        let status_changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changes.is_empty() && state.flushed_once && !status_changed {
            return None;
        }

        let mut updates = Vec::new();
        if changes.reset || !state.flushed_once {
            updates.push(BalancesUpdate::Reset {
                balances: state.set.entries(),
            });
        } else {
            let upserts: Vec<BalanceEntry> = changes
                .upserted
                .iter()
                .filter_map(|id| state.set.get(id).cloned())
                .collect();
            if !upserts.is_empty() {
                updates.push(BalancesUpdate::Upsert { balances: upserts });
            }
            if !changes.deleted.is_empty() {
                updates.push(BalancesUpdate::Delete {
                    balance_ids: changes.deleted.iter().cloned().collect(),
                });
            }
            // Status moved without any entry changing; consumers still hear it.
            if updates.is_empty() {
                updates.push(BalancesUpdate::Upsert {
                    balances: Vec::new(),
                });
            }
        }
        state.flushed_once = true;

        state
            .subscribers
            .retain(|(_, tx)| updates.iter().all(|update| tx.send(update.clone()).is_ok()));

        tracing::debug!(
            "Flushed {} update(s) for subscription {} status={:?}",
            updates.len(),
            self.key,
            status
        );

        Some(Persist {
            store: changes
                .upserted
                .iter()
                .filter_map(|id| state.set.get(id))
                .filter(|entry| entry.status == BalanceStatus::Live)
                .cloned()
                .collect(),
            remove: changes.deleted.into_iter().collect(),
        })
    }

    fn attach(&self, subscriber_id: u64) -> mpsc::UnboundedReceiver<BalancesUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.flushed_once {
            // Late joiner: hand over the current union right away.
            let _ = tx.send(BalancesUpdate::Reset {
                balances: state.set.entries(),
            });
        }
        state.subscribers.push((subscriber_id, tx));
        rx
    }

    fn detach(&self, subscriber_id: u64) {
        self.lock()
            .subscribers
            .retain(|(id, _)| *id != subscriber_id);
    }
}

/// Shared handle to one running hub.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Teardown for HubHandle {
    fn teardown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        self.shared.lock().subscribers.clear();
        tracing::info!(
            "Balance subscription {} torn down ({} tasks stopped)",
            self.shared.key,
            tasks.len()
        );
    }
}

async fn persist(cache: &dyn BalanceCache, work: Persist) {
    if let Err(err) = cache.store(&work.store).await {
        tracing::warn!("Persisting {} balance(s) failed: {}", work.store.len(), err);
    }
    if let Err(err) = cache.remove(&work.remove).await {
        tracing::warn!("Removing {} cached balance(s) failed: {}", work.remove.len(), err);
    }
}

async fn run_hub(
    shared: Arc<HubShared>,
    mut events: mpsc::UnboundedReceiver<UnitEvent>,
    cache: Arc<dyn BalanceCache>,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if shared.apply(event) {
                    debouncer.arm();
                }
            }
            _ = debouncer.wait() => {
                debouncer.clear();
                if let Some(work) = shared.flush() {
                    persist(cache.as_ref(), work).await;
                }
            }
        }
    }

    // Every producer is gone; deliver what is left.
    if debouncer.is_armed() {
        if let Some(work) = shared.flush() {
            persist(cache.as_ref(), work).await;
        }
    }
}

// ==================== UPSTREAM UNITS ====================

async fn fetch_round(
    connector: &dyn ChainConnector,
    module: &dyn BalanceModule,
    chain: &ChainRef,
    queries: &[StateQuery],
) -> Result<Vec<BalanceEntry>> {
    let responses = join_all(
        queries
            .iter()
            .map(|query| connector.send(chain, &query.method, query.params.clone())),
    )
    .await;

    queries
        .iter()
        .zip(responses)
        .map(|(query, response)| module.decode(chain, query, &response?))
        .collect()
}

struct Unit {
    chain: ChainRef,
    module: Arc<dyn BalanceModule>,
    addresses: Vec<String>,
}

async fn run_unit(
    unit: Unit,
    connector: Arc<dyn ChainConnector>,
    events: mpsc::UnboundedSender<UnitEvent>,
    poll_interval: Duration,
) {
    let partition: PartitionKey = (unit.chain.clone(), unit.module.kind());
    let queries = unit.module.build_queries(&unit.chain, &unit.addresses);
    if queries.is_empty() {
        let _ = events.send(UnitEvent::Update {
            partition,
            update: BalancesUpdate::Reset { balances: Vec::new() },
        });
        return;
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First snapshot and the first one after a failure replace the partition.
    let mut needs_reset = true;

    loop {
        ticker.tick().await;
        let event = match fetch_round(
            connector.as_ref(),
            unit.module.as_ref(),
            &unit.chain,
            &queries,
        )
        .await
        {
            Ok(balances) => {
                let update = if needs_reset {
                    BalancesUpdate::Reset { balances }
                } else {
                    BalancesUpdate::Upsert { balances }
                };
                needs_reset = false;
                UnitEvent::Update {
                    partition: partition.clone(),
                    update,
                }
            }
            Err(err) => {
                tracing::warn!(
                    "Balance round failed chain={} module={} err={}",
                    unit.chain,
                    unit.module.kind(),
                    err
                );
                needs_reset = true;
                UnitEvent::Failed {
                    partition: partition.clone(),
                }
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

async fn watch_health(
    chain: ChainRef,
    mut health: watch::Receiver<ChainHealth>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    loop {
        let current = health.borrow_and_update().clone();
        let event = UnitEvent::Health {
            chain: chain.clone(),
            health: current,
        };
        if events.send(event).is_err() || health.changed().await.is_err() {
            return;
        }
    }
}

async fn warm_start(
    targets: BTreeMap<ChainRef, Vec<String>>,
    served: HashSet<PartitionKey>,
    cache: Arc<dyn BalanceCache>,
    meta: Arc<dyn ConnectionMetaStore>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    let cached = match cache.load(&targets).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("Loading cached balances failed: {}", err);
            Vec::new()
        }
    };
    let backing_off: Vec<String> = match meta.load_all().await {
        Ok(rows) => rows
            .into_iter()
            .filter(|row| row.is_backing_off())
            .map(|row| row.chain_id)
            .collect(),
        Err(err) => {
            tracing::warn!("Loading connection metadata failed: {}", err);
            Vec::new()
        }
    };

    // A cached row nobody will ever refresh would pin the rollup at fetching.
    let (entries, orphaned): (Vec<BalanceEntry>, Vec<BalanceEntry>) = cached
        .into_iter()
        .partition(|entry| served.contains(&(entry.source.clone(), entry.module)));
    if !orphaned.is_empty() {
        tracing::debug!(
            "Ignoring {} cached balance(s) with no running unit",
            orphaned.len()
        );
    }

    let entries = entries
        .into_iter()
        .map(|entry| {
            let status = if backing_off.contains(&entry.source.to_string()) {
                BalanceStatus::Stale
            } else {
                BalanceStatus::Cache
            };
            entry.with_status(status)
        })
        .collect();
    let _ = events.send(UnitEvent::Warm { entries });
}

// ==================== AGGREGATOR ====================

struct AggregatorInner {
    connector: Arc<dyn ChainConnector>,
    registry: ModuleRegistry,
    cache: Arc<dyn BalanceCache>,
    meta: Arc<dyn ConnectionMetaStore>,
    manager: SubscriptionManager<HubHandle>,
    settings: AggregatorSettings,
    next_subscriber: AtomicU64,
}

/// Process-wide entry point for balance subscriptions. Cheap to clone.
#[derive(Clone)]
pub struct BalancesAggregator {
    inner: Arc<AggregatorInner>,
}

impl BalancesAggregator {
    pub fn new(
        connector: Arc<dyn ChainConnector>,
        registry: ModuleRegistry,
        cache: Arc<dyn BalanceCache>,
        meta: Arc<dyn ConnectionMetaStore>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                connector,
                registry,
                cache,
                meta,
                manager: SubscriptionManager::new(),
                settings,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Attaches to the hub for `params`, starting it if this is the first
    /// subscriber. Must be called from within a tokio runtime.
    pub fn subscribe(&self, params: &BalancesParams) -> BalancesSubscription {
        let targets = params.targets();
        let key = SubscriptionKey::derive(&targets);
        let (hub, created) = self
            .inner
            .manager
            .acquire(&key, || self.start_hub(key.clone(), targets));
        if created {
            tracing::info!("Opened balance subscription {}", key);
        }

        let subscriber_id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let updates = hub.shared.attach(subscriber_id);
        let status = hub.shared.status.subscribe();

        BalancesSubscription {
            key,
            subscriber_id,
            updates,
            status,
            hub,
            aggregator: self.inner.clone(),
            released: false,
        }
    }

    fn start_hub(&self, key: SubscriptionKey, targets: BTreeMap<ChainRef, Vec<String>>) -> HubHandle {
        let inner = &self.inner;
        let shared = Arc::new(HubShared::new(key));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tasks = vec![tokio::spawn(run_hub(
            shared.clone(),
            events_rx,
            inner.cache.clone(),
            inner.settings.debounce,
        ))];

        let mut served = HashSet::new();
        for (chain, addresses) in &targets {
            let modules = inner.registry.for_chain(chain);
            if modules.is_empty() {
                tracing::warn!("No balance module serves {}; skipping", chain);
                continue;
            }

            tasks.push(tokio::spawn(watch_health(
                chain.clone(),
                inner.connector.health(chain),
                events_tx.clone(),
            )));

            for module in modules {
                served.insert((chain.clone(), module.kind()));
                let unit = Unit {
                    chain: chain.clone(),
                    module,
                    addresses: addresses.clone(),
                };
                tasks.push(tokio::spawn(run_unit(
                    unit,
                    inner.connector.clone(),
                    events_tx.clone(),
                    inner.settings.poll_interval,
                )));
            }
        }

        tasks.push(tokio::spawn(warm_start(
            targets,
            served,
            inner.cache.clone(),
            inner.meta.clone(),
            events_tx,
        )));

        HubHandle {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.manager.stats()
    }

    pub fn chain_health(&self) -> Vec<ChainHealthReport> {
        self.inner
            .connector
            .chains()
            .into_iter()
            .map(|chain| {
                let health = self.inner.connector.health(&chain).borrow().clone();
                ChainHealthReport {
                    chain: chain.to_string(),
                    health,
                }
            })
            .collect()
    }
}

/// One consumer's view of a shared hub. Dropping it unsubscribes.
pub struct BalancesSubscription {
    key: SubscriptionKey,
    subscriber_id: u64,
    updates: mpsc::UnboundedReceiver<BalancesUpdate>,
    status: watch::Receiver<AggregateStatus>,
    hub: HubHandle,
    aggregator: Arc<AggregatorInner>,
    released: bool,
}

impl BalancesSubscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Next coalesced update; `None` once unsubscribed or torn down.
    pub async fn next(&mut self) -> Option<BalancesUpdate> {
        if self.released {
            return None;
        }
        self.updates.recv().await
    }

    pub fn status(&self) -> AggregateStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<AggregateStatus> {
        self.status.clone()
    }

    /// Safe to call repeatedly; only the first call drops the reference.
    pub fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.hub.shared.detach(self.subscriber_id);
        self.updates.close();
        self.aggregator.manager.release(&self.key);
    }
}

impl Drop for BalancesSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBalanceCache;
    use crate::db::MemoryMetaStore;
    use crate::error::AppError;
    use crate::models::{BalanceModuleKind, EvmAddressParams, Planck};
    use async_trait::async_trait;
    use super::modules::EvmNativeModule;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    const ALICE: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";

    /// Answers every query on a chain with one canned hex quantity.
    #[derive(Default)]
    struct ScriptedConnector {
        results: Mutex<HashMap<ChainRef, String>>,
        failing: Mutex<HashSet<ChainRef>>,
        stalled: Mutex<HashSet<ChainRef>>,
        health: Mutex<HashMap<ChainRef, watch::Sender<ChainHealth>>>,
        sends: AtomicUsize,
    }

    impl ScriptedConnector {
        fn set_result(&self, chain: &ChainRef, hex: &str) {
            self.results.lock().unwrap().insert(chain.clone(), hex.to_string());
        }

        fn set_failing(&self, chain: &ChainRef, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(chain.clone());
            } else {
                set.remove(chain);
            }
        }

        // Queries on `chain` never answer, so only the cache speaks for it.
        fn set_stalled(&self, chain: &ChainRef) {
            self.stalled.lock().unwrap().insert(chain.clone());
        }

        fn sender(&self, chain: &ChainRef) -> watch::Sender<ChainHealth> {
            self.health
                .lock()
                .unwrap()
                .entry(chain.clone())
                .or_insert_with(|| watch::channel(ChainHealth::Connecting).0)
                .clone()
        }

        fn set_health(&self, chain: &ChainRef, health: ChainHealth) {
            self.sender(chain).send_replace(health);
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainConnector for ScriptedConnector {
        async fn send(
            &self,
            chain: &ChainRef,
            _method: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let stalled = self.stalled.lock().unwrap().contains(chain);
            if stalled {
                std::future::pending::<()>().await;
            }
            if self.failing.lock().unwrap().contains(chain) {
                return Err(AppError::ChainQueryFailed {
                    chain: chain.to_string(),
                    message: "scripted failure".to_string(),
                });
            }
            let result = self
                .results
                .lock()
                .unwrap()
                .get(chain)
                .cloned()
                .unwrap_or_else(|| "0x0".to_string());
            Ok(serde_json::json!(result))
        }

        fn health(&self, chain: &ChainRef) -> watch::Receiver<ChainHealth> {
            self.sender(chain).subscribe()
        }

        fn chains(&self) -> Vec<ChainRef> {
            let mut chains: Vec<ChainRef> = self.health.lock().unwrap().keys().cloned().collect();
            chains.sort();
            chains
        }
    }

    fn mainnet() -> ChainRef {
        ChainRef::Evm("1".to_string())
    }

    fn polygon() -> ChainRef {
        ChainRef::Evm("137".to_string())
    }

    fn registry() -> ModuleRegistry {
        let networks = HashMap::from([
            ("1".to_string(), "ETH".to_string()),
            ("137".to_string(), "MATIC".to_string()),
        ]);
        ModuleRegistry::new().with(Arc::new(EvmNativeModule::new(networks)))
    }

    struct Fixture {
        connector: Arc<ScriptedConnector>,
        cache: Arc<MemoryBalanceCache>,
        meta: Arc<MemoryMetaStore>,
        aggregator: BalancesAggregator,
    }

    fn fixture() -> Fixture {
        let connector = Arc::new(ScriptedConnector::default());
        let cache = Arc::new(MemoryBalanceCache::new());
        let meta = Arc::new(MemoryMetaStore::new());
        let aggregator = BalancesAggregator::new(
            connector.clone(),
            registry(),
            cache.clone(),
            meta.clone(),
            AggregatorSettings {
                debounce: Duration::from_millis(10),
                poll_interval: Duration::from_millis(25),
            },
        );
        Fixture {
            connector,
            cache,
            meta,
            aggregator,
        }
    }

    fn params(networks: &[&str]) -> BalancesParams {
        BalancesParams {
            chain_addresses: BTreeMap::new(),
            evm_addresses: EvmAddressParams {
                addresses: vec![ALICE.to_string()],
                networks: networks.iter().map(|n| n.to_string()).collect(),
            },
        }
    }

    fn entry_id(network: &str) -> String {
        format!("{}-evm:{}-native", ALICE, network)
    }

    // Applies updates the way a UI consumer would.
    fn apply_mirror(mirror: &mut BTreeMap<String, BalanceEntry>, update: BalancesUpdate) {
        match update {
            BalancesUpdate::Reset { balances } => {
                mirror.clear();
                mirror.extend(balances.into_iter().map(|e| (e.id.clone(), e)));
            }
            BalancesUpdate::Upsert { balances } => {
                mirror.extend(balances.into_iter().map(|e| (e.id.clone(), e)));
            }
            BalancesUpdate::Delete { balance_ids } => {
                for id in balance_ids {
                    mirror.remove(&id);
                }
            }
        }
    }

    async fn wait_for<F>(
        sub: &mut BalancesSubscription,
        mirror: &mut BTreeMap<String, BalanceEntry>,
        condition: F,
    ) where
        F: Fn(&BTreeMap<String, BalanceEntry>, AggregateStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if condition(mirror, sub.status()) {
                    return;
                }
                match sub.next().await {
                    Some(update) => apply_mirror(mirror, update),
                    None => panic!("subscription closed"),
                }
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn identical_params_share_one_hub() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");

        let mut a = fx.aggregator.subscribe(&params(&["1"]));
        let mut b = fx.aggregator.subscribe(&params(&["1"]));
        assert_eq!(a.key(), b.key());

        let stats = fx.aggregator.stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.active_keys, 1);
        assert_eq!(stats.subscribers, 2);

        let (mut ma, mut mb) = (BTreeMap::new(), BTreeMap::new());
        wait_for(&mut a, &mut ma, |m, _| m.contains_key(&entry_id("1"))).await;
        wait_for(&mut b, &mut mb, |m, _| m.contains_key(&entry_id("1"))).await;

        drop(a);
        assert_eq!(fx.aggregator.stats().torn_down, 0);
        drop(b);
        let stats = fx.aggregator.stats();
        assert_eq!(stats.torn_down, 1);
        assert_eq!(stats.active_keys, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let fx = fixture();
        let mut a = fx.aggregator.subscribe(&params(&["1"]));
        let _b = fx.aggregator.subscribe(&params(&["1"]));

        a.unsubscribe();
        a.unsubscribe();
        drop(a);

        let stats = fx.aggregator.stats();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.torn_down, 0);
    }

    #[tokio::test]
    async fn failing_chain_goes_stale_without_touching_others() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");
        fx.connector.set_result(&polygon(), "0xc8");

        let mut sub = fx.aggregator.subscribe(&params(&["1", "137"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, s| {
            m.len() == 2 && s == AggregateStatus::Live
        })
        .await;

        fx.connector.set_failing(&polygon(), true);
        wait_for(&mut sub, &mut mirror, |m, s| {
            s == AggregateStatus::Stale
                && m.get(&entry_id("137")).map(|e| e.status) == Some(BalanceStatus::Stale)
        })
        .await;

        let eth = &mirror[&entry_id("1")];
        assert_eq!(eth.status, BalanceStatus::Live);
        assert_eq!(eth.free, Planck::from(100u128));
        assert_eq!(mirror[&entry_id("137")].free, Planck::from(200u128));

        fx.connector.set_failing(&polygon(), false);
        wait_for(&mut sub, &mut mirror, |m, s| {
            s == AggregateStatus::Live
                && m.get(&entry_id("137")).map(|e| e.status) == Some(BalanceStatus::Live)
        })
        .await;
        assert_eq!(mirror.len(), 2);
    }

    #[tokio::test]
    async fn chain_backoff_marks_entries_stale_until_fresh_data() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, s| !m.is_empty() && s == AggregateStatus::Live).await;

        fx.connector.set_failing(&mainnet(), true);
        fx.connector.set_health(
            &mainnet(),
            ChainHealth::Backoff {
                failures: 3,
                retry_in_ms: 2_000,
            },
        );
        wait_for(&mut sub, &mut mirror, |m, s| {
            s == AggregateStatus::Stale
                && m.get(&entry_id("1")).map(|e| e.status) == Some(BalanceStatus::Stale)
        })
        .await;
        // Stale data is kept, not deleted.
        assert_eq!(mirror[&entry_id("1")].free, Planck::from(100u128));

        fx.connector.set_failing(&mainnet(), false);
        fx.connector.set_health(&mainnet(), ChainHealth::Healthy);
        wait_for(&mut sub, &mut mirror, |m, s| {
            s == AggregateStatus::Live
                && m.get(&entry_id("1")).map(|e| e.status) == Some(BalanceStatus::Live)
        })
        .await;
    }

    fn native_eth(free: u128) -> BalanceEntry {
        BalanceEntry::new(ALICE, mainnet(), BalanceModuleKind::EvmNative, "native", "ETH", 18)
            .with_amounts(Planck::from(free), Planck::zero(), Planck::zero())
    }

    #[tokio::test]
    async fn status_is_fetching_before_anything_arrives() {
        let fx = fixture();
        fx.connector.set_stalled(&mainnet());
        let sub = fx.aggregator.subscribe(&params(&["1"]));
        assert_eq!(sub.status(), AggregateStatus::Fetching);
    }

    #[tokio::test]
    async fn cached_entries_are_served_as_fetching() {
        let fx = fixture();
        fx.connector.set_stalled(&mainnet());
        fx.cache.store(&[native_eth(7)]).await.unwrap();

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let update = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        let BalancesUpdate::Reset { balances } = update else {
            panic!("first update must be a reset");
        };
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].status, BalanceStatus::Cache);
        assert_eq!(sub.status(), AggregateStatus::Fetching);
    }

    #[tokio::test]
    async fn cached_entries_of_backing_off_chain_start_stale() {
        let fx = fixture();
        fx.connector.set_stalled(&mainnet());
        fx.meta
            .save(&crate::db::ConnectionMeta {
                chain_id: mainnet().to_string(),
                priority_rpc: None,
                backoff_interval_ms: 4_000,
                consecutive_failures: 3,
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        fx.cache.store(&[native_eth(0)]).await.unwrap();

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, s| !m.is_empty() && s == AggregateStatus::Stale).await;
    }

    #[tokio::test]
    async fn cached_rows_without_a_unit_do_not_pin_fetching() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");
        let dot = BalanceEntry::new(
            "5F3sa2TJAWMqDhXG6jhV4N8ko9SxwGy8TpaNS1repo5EYjQX",
            ChainRef::Substrate("polkadot".to_string()),
            BalanceModuleKind::SubstrateNative,
            "native",
            "DOT",
            10,
        );
        fx.cache.store(&[dot.clone()]).await.unwrap();

        // The registry has no substrate module, so polkadot is never polled.
        let mut request = params(&["1"]);
        request
            .chain_addresses
            .insert("polkadot".to_string(), vec![dot.address.clone()]);
        let mut sub = fx.aggregator.subscribe(&request);
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, s| {
            m.contains_key(&entry_id("1")) && s == AggregateStatus::Live
        })
        .await;
        assert!(!mirror.contains_key(&dot.id));
    }

    #[tokio::test]
    async fn status_only_change_reaches_subscribers() {
        let fx = fixture();
        fx.connector.set_failing(&mainnet(), true);

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let first = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, BalancesUpdate::Reset { balances: Vec::new() });

        fx.connector.set_health(
            &mainnet(),
            ChainHealth::Backoff {
                failures: 3,
                retry_in_ms: 2_000,
            },
        );
        let update = tokio::time::timeout(Duration::from_millis(300), sub.next())
            .await
            .expect("status change was not streamed")
            .unwrap();
        assert_eq!(update, BalancesUpdate::Upsert { balances: Vec::new() });
        assert_eq!(sub.status(), AggregateStatus::Stale);

        fx.connector.set_health(&mainnet(), ChainHealth::Healthy);
        let update = tokio::time::timeout(Duration::from_millis(300), sub.next())
            .await
            .expect("recovery was not streamed")
            .unwrap();
        assert_eq!(update, BalancesUpdate::Upsert { balances: Vec::new() });
        assert_eq!(sub.status(), AggregateStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_flushes_once_with_last_value() {
        let window = Duration::from_millis(50);
        let shared = Arc::new(HubShared::new(SubscriptionKey::derive(&BTreeMap::new())));
        let mut rx = shared.attach(1);
        let (tx, events) = mpsc::unbounded_channel();
        let hub = tokio::spawn(run_hub(
            shared.clone(),
            events,
            Arc::new(MemoryBalanceCache::new()),
            window,
        ));
        let partition: PartitionKey = (mainnet(), BalanceModuleKind::EvmNative);
        let push = |update: BalancesUpdate| {
            tx.send(UnitEvent::Update {
                partition: partition.clone(),
                update,
            })
            .unwrap();
        };

        let started = tokio::time::Instant::now();
        push(BalancesUpdate::Reset { balances: vec![native_eth(1)] });
        for free in 2..=4 {
            push(BalancesUpdate::Upsert { balances: vec![native_eth(free)] });
        }
        let first = rx.recv().await.unwrap();
        assert!(started.elapsed() >= window);
        assert_eq!(first, BalancesUpdate::Reset { balances: vec![native_eth(4)] });

        for free in 5..=7 {
            push(BalancesUpdate::Upsert { balances: vec![native_eth(free)] });
        }
        let second = rx.recv().await.unwrap();
        assert_eq!(second, BalancesUpdate::Upsert { balances: vec![native_eth(7)] });

        tokio::time::sleep(window * 4).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(*shared.status.borrow(), AggregateStatus::Live);

        drop(push);
        drop(tx);
        hub.await.unwrap();
    }

    #[tokio::test]
    async fn live_values_replace_cache_and_are_persisted() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");
        fx.cache.store(&[native_eth(1)]).await.unwrap();

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, s| {
            s == AggregateStatus::Live
                && m.get(&entry_id("1")).map(|e| e.free) == Some(Planck::from(100u128))
        })
        .await;

        let mut targets = BTreeMap::new();
        targets.insert(mainnet(), vec![ALICE.to_string()]);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stored = fx.cache.load(&targets).await.unwrap();
                if stored.first().map(|e| e.free) == Some(Planck::from(100u128)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cache not updated");
    }

    #[tokio::test]
    async fn late_joiner_receives_current_union() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");

        let mut first = fx.aggregator.subscribe(&params(&["1"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut first, &mut mirror, |m, _| !m.is_empty()).await;

        let mut late = fx.aggregator.subscribe(&params(&["1"]));
        let update = tokio::time::timeout(Duration::from_millis(5), late.next())
            .await
            .expect("late joiner waited for a flush")
            .unwrap();
        assert!(matches!(update, BalancesUpdate::Reset { ref balances } if balances.len() == 1));
    }

    #[tokio::test]
    async fn teardown_stops_upstream_polling() {
        let fx = fixture();
        fx.connector.set_result(&mainnet(), "0x64");

        let mut sub = fx.aggregator.subscribe(&params(&["1"]));
        let mut mirror = BTreeMap::new();
        wait_for(&mut sub, &mut mirror, |m, _| !m.is_empty()).await;
        drop(sub);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_teardown = fx.connector.sends();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.connector.sends(), after_teardown);
    }

    #[tokio::test]
    async fn empty_params_still_deliver_an_initial_reset() {
        let fx = fixture();
        let mut sub = fx.aggregator.subscribe(&BalancesParams::default());
        let update = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, BalancesUpdate::Reset { balances: Vec::new() });
        assert_eq!(sub.status(), AggregateStatus::Live);
    }
}
