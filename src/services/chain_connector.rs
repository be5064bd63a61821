use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    config::Config,
    db::{ConnectionMeta, ConnectionMetaStore},
    error::{AppError, Result},
    models::ChainRef,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ChainHealth {
    Connecting,
    Healthy,
    Backoff { failures: u32, retry_in_ms: u64 },
}

impl ChainHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Backoff { .. })
    }
}

/// Networking capability the balances aggregator consumes.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Executes one JSON-RPC call against `chain`. Retry and backoff live
    /// here, never in callers.
    async fn send(
        &self,
        chain: &ChainRef,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value>;

    fn health(&self, chain: &ChainRef) -> watch::Receiver<ChainHealth>;

    fn chains(&self) -> Vec<ChainRef>;
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BreakerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.rpc_breaker_threshold,
            base: Duration::from_millis(config.rpc_breaker_base_ms),
            max: Duration::from_millis(config.rpc_breaker_max_ms),
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        if failures <= self.threshold {
            return self.base;
        }
        let exponent = (failures - self.threshold).min(6);
        let multiplier = 1_u32 << exponent;
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now))
    }

    fn record_success(&mut self) -> bool {
        let was_failing = self.consecutive_failures != 0 || self.open_until.is_some();
        self.consecutive_failures = 0;
        self.open_until = None;
        was_failing
    }

    /// Returns the backoff when this failure opens (or re-opens) the circuit.
    fn record_failure(&mut self, now: Instant, settings: &BreakerSettings) -> Option<Duration> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < settings.threshold {
            return None;
        }
        let backoff = settings.backoff(self.consecutive_failures);
        self.open_until = Some(now + backoff);
        Some(backoff)
    }
}

struct ChainState {
    urls: Vec<String>,
    priority: usize,
    breaker: CircuitBreaker,
    health: watch::Sender<ChainHealth>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

enum AttemptError {
    // Endpoint unreachable or answered garbage: try the next url.
    Transport(String),
    // Node answered with a JSON-RPC error: the connection itself is fine.
    Rpc(String),
}

fn rpc_request(id: u64, method: &str, params: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id
    })
}

/// JSON-RPC over HTTP for substrate chains and EVM networks alike.
///
/// Each chain has a url pool tried in priority order (last url that worked
/// first) and a circuit breaker; the breaker state is published as
/// `ChainHealth` and persisted as connection metadata.
pub struct JsonRpcConnector {
    client: reqwest::Client,
    chains: Mutex<HashMap<ChainRef, ChainState>>,
    settings: BreakerSettings,
    meta: Arc<dyn ConnectionMetaStore>,
    next_id: AtomicU64,
}

impl JsonRpcConnector {
    pub fn new(
        pools: Vec<(ChainRef, Vec<String>)>,
        settings: BreakerSettings,
        timeout: Duration,
        meta: Arc<dyn ConnectionMetaStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("HTTP client init failed: {}", e)))?;

        let chains = pools
            .into_iter()
            .map(|(chain, urls)| {
                let (health, _) = watch::channel(ChainHealth::Connecting);
                (
                    chain,
                    ChainState {
                        urls,
                        priority: 0,
                        breaker: CircuitBreaker::default(),
                        health,
                    },
                )
            })
            .collect();

        Ok(Self {
            client,
            chains: Mutex::new(chains),
            settings,
            meta,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &Config, meta: Arc<dyn ConnectionMetaStore>) -> Result<Self> {
        let pools = config
            .chains()
            .into_iter()
            .map(|chain| {
                let urls = config.rpc_urls(&chain);
                (chain, urls)
            })
            .collect();
        Self::new(
            pools,
            BreakerSettings::from_config(config),
            Duration::from_millis(config.rpc_timeout_ms),
            meta,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChainRef, ChainState>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves each chain's last-known-good endpoint to the front of its pool.
    pub async fn restore_priorities(&self) -> Result<()> {
        let saved = self.meta.load_all().await?;
        let mut chains = self.lock();
        for (chain, state) in chains.iter_mut() {
            let key = chain.to_string();
            let Some(url) = saved
                .iter()
                .find(|meta| meta.chain_id == key)
                .and_then(|meta| meta.priority_rpc.as_ref())
            else {
                continue;
            };
            if let Some(index) = state.urls.iter().position(|u| u == url) {
                state.priority = index;
                tracing::debug!("Restored priority RPC for {}: {}", chain, url);
            }
        }
        Ok(())
    }

    async fn attempt(
        &self,
        url: &str,
        method: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, AttemptError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(url)
            .json(&rpc_request(id, method, params.clone()))
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Transport(format!("HTTP {}", status)));
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        if let Some(error) = envelope.error {
            return Err(AttemptError::Rpc(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        Ok(envelope.result.unwrap_or(serde_json::Value::Null))
    }

    fn record_success(&self, chain: &ChainRef, url_index: usize) {
        let meta = {
            let mut chains = self.lock();
            let Some(state) = chains.get_mut(chain) else {
                return;
            };
            let recovered = state.breaker.record_success();
            let moved = state.priority != url_index;
            state.priority = url_index;
            state.health.send_if_modified(|health| {
                if *health == ChainHealth::Healthy {
                    return false;
                }
                *health = ChainHealth::Healthy;
                true
            });
            if recovered {
                tracing::info!("{} RPC recovered", chain);
            }
            (recovered || moved).then(|| ConnectionMeta {
                chain_id: chain.to_string(),
                priority_rpc: state.urls.get(url_index).cloned(),
                backoff_interval_ms: 0,
                consecutive_failures: 0,
                updated_at: Utc::now(),
            })
        };
        if let Some(meta) = meta {
            self.persist(meta);
        }
    }

    fn record_failure(&self, chain: &ChainRef, error_text: &str) {
        let meta = {
            let mut chains = self.lock();
            let Some(state) = chains.get_mut(chain) else {
                return;
            };
            let backoff = state.breaker.record_failure(Instant::now(), &self.settings);
            let failures = state.breaker.consecutive_failures;
            let Some(backoff) = backoff else {
                tracing::debug!("{} RPC failure {} below threshold: {}", chain, failures, error_text);
                return;
            };

            tracing::warn!(
                "{} RPC failure triggered circuit backoff={}ms failures={} err={}",
                chain,
                backoff.as_millis(),
                failures,
                error_text
            );
            state.health.send_replace(ChainHealth::Backoff {
                failures,
                retry_in_ms: backoff.as_millis() as u64,
            });
            ConnectionMeta {
                chain_id: chain.to_string(),
                priority_rpc: state.urls.get(state.priority).cloned(),
                backoff_interval_ms: backoff.as_millis() as i64,
                consecutive_failures: failures as i32,
                updated_at: Utc::now(),
            }
        };
        self.persist(meta);
    }

    fn persist(&self, meta: ConnectionMeta) {
        let store = self.meta.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save(&meta).await {
                tracing::warn!("Saving connection meta for {} failed: {}", meta.chain_id, err);
            }
        });
    }
}

#[async_trait]
impl ChainConnector for JsonRpcConnector {
    async fn send(
        &self,
        chain: &ChainRef,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let ordered: Vec<(usize, String)> = {
            let chains = self.lock();
            let state = chains.get(chain).ok_or_else(|| AppError::ChainQueryFailed {
                chain: chain.to_string(),
                message: "chain not configured".to_string(),
            })?;
            if let Some(remaining) = state.breaker.remaining(Instant::now()) {
                return Err(AppError::ChainQueryFailed {
                    chain: chain.to_string(),
                    message: format!(
                        "{} skipped: circuit open for {}ms",
                        method,
                        remaining.as_millis()
                    ),
                });
            }
            let len = state.urls.len();
            (0..len)
                .map(|offset| {
                    let index = (state.priority + offset) % len;
                    (index, state.urls[index].clone())
                })
                .collect()
        };

        let mut last_error = "no RPC endpoints configured".to_string();
        for (index, url) in ordered {
            match self.attempt(&url, method, &params).await {
                Ok(value) => {
                    self.record_success(chain, index);
                    return Ok(value);
                }
                Err(AttemptError::Rpc(message)) => {
                    self.record_success(chain, index);
                    return Err(AppError::ChainQueryFailed {
                        chain: chain.to_string(),
                        message: format!("{}: {}", method, message),
                    });
                }
                Err(AttemptError::Transport(message)) => {
                    tracing::debug!("{} {} via {} failed: {}", chain, method, url, message);
                    last_error = message;
                }
            }
        }

        self.record_failure(chain, &last_error);
        Err(AppError::ChainQueryFailed {
            chain: chain.to_string(),
            message: format!("{}: {}", method, last_error),
        })
    }

    fn health(&self, chain: &ChainRef) -> watch::Receiver<ChainHealth> {
        match self.lock().get(chain) {
            Some(state) => state.health.subscribe(),
            None => watch::channel(ChainHealth::Connecting).1,
        }
    }

    fn chains(&self) -> Vec<ChainRef> {
        let mut chains: Vec<ChainRef> = self.lock().keys().cloned().collect();
        chains.sort();
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryMetaStore;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            threshold: 2,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let s = settings();
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(2), Duration::from_millis(100));
        assert_eq!(s.backoff(3), Duration::from_millis(200));
        assert_eq!(s.backoff(4), Duration::from_millis(400));
        assert_eq!(s.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn breaker_opens_at_threshold_and_closes_on_success() {
        let s = settings();
        let now = Instant::now();
        let mut breaker = CircuitBreaker::default();

        assert!(breaker.record_failure(now, &s).is_none());
        assert!(breaker.remaining(now).is_none());
        assert!(breaker.record_failure(now, &s).is_some());
        assert!(breaker.remaining(now).is_some());

        assert!(breaker.record_success());
        assert!(breaker.remaining(now).is_none());
        assert!(!breaker.record_success());
    }

    fn unreachable_connector() -> JsonRpcConnector {
        // Port 9 (discard) on localhost refuses connections.
        JsonRpcConnector::new(
            vec![(
                ChainRef::Evm("1".to_string()),
                vec!["http://127.0.0.1:9".to_string()],
            )],
            settings(),
            Duration::from_millis(200),
            Arc::new(MemoryMetaStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_chain_is_a_query_failure() {
        let connector = unreachable_connector();
        let err = connector
            .send(&ChainRef::Evm("999".to_string()), "eth_blockNumber", serde_json::json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChainQueryFailed { .. }));
    }

    #[tokio::test]
    async fn repeated_transport_failures_enter_backoff() {
        let connector = unreachable_connector();
        let chain = ChainRef::Evm("1".to_string());
        let health = connector.health(&chain);
        assert_eq!(*health.borrow(), ChainHealth::Connecting);

        for _ in 0..2 {
            let _ = connector
                .send(&chain, "eth_blockNumber", serde_json::json!([]))
                .await;
        }
        assert!(health.borrow().is_degraded());

        let skipped = connector
            .send(&chain, "eth_blockNumber", serde_json::json!([]))
            .await
            .unwrap_err();
        assert!(skipped.to_string().contains("circuit open"));
    }

    #[tokio::test]
    async fn restore_priorities_moves_saved_url_first() {
        let meta = Arc::new(MemoryMetaStore::new());
        meta.save(&ConnectionMeta {
            chain_id: "evm:1".to_string(),
            priority_rpc: Some("http://b".to_string()),
            backoff_interval_ms: 0,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let connector = JsonRpcConnector::new(
            vec![(
                ChainRef::Evm("1".to_string()),
                vec!["http://a".to_string(), "http://b".to_string()],
            )],
            settings(),
            Duration::from_millis(200),
            meta,
        )
        .unwrap();
        connector.restore_priorities().await.unwrap();

        let chains = connector.lock();
        assert_eq!(chains[&ChainRef::Evm("1".to_string())].priority, 1);
    }
}
