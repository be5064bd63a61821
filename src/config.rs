use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::constants::{
    BALANCES_DEBOUNCE_MS_DEFAULT, BALANCES_POLL_INTERVAL_MS_DEFAULT, RPC_BREAKER_BASE_MS_DEFAULT,
    RPC_BREAKER_MAX_MS_DEFAULT, RPC_BREAKER_THRESHOLD_DEFAULT, RPC_TIMEOUT_MS_DEFAULT,
};
use crate::models::ChainRef;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Storage
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,

    // Balances
    pub balances_debounce_ms: u64,
    pub balances_poll_interval_ms: u64,

    // Chain connector
    pub rpc_timeout_ms: u64,
    pub rpc_breaker_threshold: u32,
    pub rpc_breaker_base_ms: u64,
    pub rpc_breaker_max_ms: u64,

    // Chains
    pub substrate_chains: Vec<SubstrateChainConfig>,
    pub evm_networks: Vec<EvmNetworkConfig>,

    // CORS
    pub cors_allowed_origins: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubstrateChainConfig {
    pub id: String,
    pub rpc_urls: Vec<String>,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmNetworkConfig {
    pub id: String,
    pub rpc_urls: Vec<String>,
    pub symbol: String,
    pub erc20_tokens: Vec<Erc20TokenConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Erc20TokenConfig {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

// Internal helper that supports `env_non_empty` operations.
fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_non_empty(name) {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

/// Splits an RPC pool or id list on any of the separators operators tend to use.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ';', '\n', '\r', ' '])
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// `polkadot` -> `POLKADOT`, `asset-hub` -> `ASSET_HUB`.
fn env_suffix(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Parses `address:symbol:decimals` entries.
pub fn parse_erc20_tokens(raw: &str) -> anyhow::Result<Vec<Erc20TokenConfig>> {
    parse_list(raw)
        .into_iter()
        .map(|entry| {
            let mut parts = entry.split(':');
            let (Some(address), Some(symbol), Some(decimals), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                anyhow::bail!("invalid ERC20 token entry `{}`", entry);
            };
            Ok(Erc20TokenConfig {
                address: address.to_ascii_lowercase(),
                symbol: symbol.to_string(),
                decimals: decimals.parse()?,
            })
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let substrate_chains = env_non_empty("SUBSTRATE_CHAINS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default()
            .into_iter()
            .map(|id| -> anyhow::Result<SubstrateChainConfig> {
                let suffix = env_suffix(&id);
                Ok(SubstrateChainConfig {
                    rpc_urls: env_non_empty(&format!("SUBSTRATE_RPC_{}", suffix))
                        .map(|raw| parse_list(&raw))
                        .unwrap_or_default(),
                    symbol: env_non_empty(&format!("SUBSTRATE_SYMBOL_{}", suffix))
                        .unwrap_or_else(|| "DOT".to_string()),
                    decimals: env_parse(&format!("SUBSTRATE_DECIMALS_{}", suffix), 10)?,
                    id,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let evm_networks = env_non_empty("EVM_NETWORKS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default()
            .into_iter()
            .map(|id| -> anyhow::Result<EvmNetworkConfig> {
                let suffix = env_suffix(&id);
                Ok(EvmNetworkConfig {
                    rpc_urls: env_non_empty(&format!("EVM_RPC_{}", suffix))
                        .map(|raw| parse_list(&raw))
                        .unwrap_or_default(),
                    symbol: env_non_empty(&format!("EVM_SYMBOL_{}", suffix))
                        .unwrap_or_else(|| "ETH".to_string()),
                    erc20_tokens: match env_non_empty(&format!("EVM_ERC20_{}", suffix)) {
                        Some(raw) => parse_erc20_tokens(&raw)?,
                        None => Vec::new(),
                    },
                    id,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3000)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            database_url: env_non_empty("DATABASE_URL"),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: env_non_empty("REDIS_URL"),

            balances_debounce_ms: env_parse("BALANCES_DEBOUNCE_MS", BALANCES_DEBOUNCE_MS_DEFAULT)?,
            balances_poll_interval_ms: env_parse(
                "BALANCES_POLL_INTERVAL_MS",
                BALANCES_POLL_INTERVAL_MS_DEFAULT,
            )?,

            rpc_timeout_ms: env_parse("RPC_TIMEOUT_MS", RPC_TIMEOUT_MS_DEFAULT)?,
            rpc_breaker_threshold: env_parse(
                "RPC_BREAKER_THRESHOLD",
                RPC_BREAKER_THRESHOLD_DEFAULT,
            )?,
            rpc_breaker_base_ms: env_parse("RPC_BREAKER_BASE_MS", RPC_BREAKER_BASE_MS_DEFAULT)?,
            rpc_breaker_max_ms: env_parse("RPC_BREAKER_MAX_MS", RPC_BREAKER_MAX_MS_DEFAULT)?,

            substrate_chains,
            evm_networks,

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.balances_debounce_ms == 0 {
            anyhow::bail!("BALANCES_DEBOUNCE_MS must be greater than zero");
        }
        if self.balances_poll_interval_ms == 0 {
            anyhow::bail!("BALANCES_POLL_INTERVAL_MS must be greater than zero");
        }
        if self.rpc_breaker_threshold == 0 {
            anyhow::bail!("RPC_BREAKER_THRESHOLD must be greater than zero");
        }
        if self.rpc_breaker_base_ms > self.rpc_breaker_max_ms {
            anyhow::bail!("RPC_BREAKER_BASE_MS exceeds RPC_BREAKER_MAX_MS");
        }
        for chain in &self.substrate_chains {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("SUBSTRATE_RPC_{} is empty", env_suffix(&chain.id));
            }
        }
        for network in &self.evm_networks {
            if network.rpc_urls.is_empty() {
                anyhow::bail!("EVM_RPC_{} is empty", env_suffix(&network.id));
            }
        }

        if self.substrate_chains.is_empty() && self.evm_networks.is_empty() {
            tracing::warn!("No chains configured; balance subscriptions will stay empty");
        }
        if self.database_url.is_none() {
            tracing::warn!("DATABASE_URL not set; connection metadata kept in memory");
        }
        if self.redis_url.is_none() {
            tracing::warn!("REDIS_URL not set; balance cache kept in memory");
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn balances_debounce(&self) -> Duration {
        Duration::from_millis(self.balances_debounce_ms)
    }

    pub fn balances_poll_interval(&self) -> Duration {
        Duration::from_millis(self.balances_poll_interval_ms)
    }

    pub fn substrate_chain(&self, id: &str) -> Option<&SubstrateChainConfig> {
        self.substrate_chains.iter().find(|chain| chain.id == id)
    }

    pub fn evm_network(&self, id: &str) -> Option<&EvmNetworkConfig> {
        self.evm_networks.iter().find(|network| network.id == id)
    }

    /// RPC url pool for a chain, in configured priority order.
    pub fn rpc_urls(&self, chain: &ChainRef) -> Vec<String> {
        match chain {
            ChainRef::Substrate(id) => self
                .substrate_chain(id)
                .map(|c| c.rpc_urls.clone())
                .unwrap_or_default(),
            ChainRef::Evm(id) => self
                .evm_network(id)
                .map(|n| n.rpc_urls.clone())
                .unwrap_or_default(),
        }
    }

    /// Every chain the service knows how to reach.
    pub fn chains(&self) -> Vec<ChainRef> {
        self.substrate_chains
            .iter()
            .map(|c| ChainRef::Substrate(c.id.clone()))
            .chain(self.evm_networks.iter().map(|n| ChainRef::Evm(n.id.clone())))
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
        database_url: None,
        database_max_connections: 1,
        redis_url: None,
        balances_debounce_ms: 10,
        balances_poll_interval_ms: 25,
        rpc_timeout_ms: 500,
        rpc_breaker_threshold: 2,
        rpc_breaker_base_ms: 50,
        rpc_breaker_max_ms: 400,
        substrate_chains: vec![SubstrateChainConfig {
            id: "polkadot".to_string(),
            rpc_urls: vec!["http://localhost:9933".to_string()],
            symbol: "DOT".to_string(),
            decimals: 10,
        }],
        evm_networks: vec![EvmNetworkConfig {
            id: "1".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            symbol: "ETH".to_string(),
            erc20_tokens: vec![Erc20TokenConfig {
                address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
                symbol: "USDC".to_string(),
                decimals: 6,
            }],
        }],
        cors_allowed_origins: "*".to_string(),
    }
}
