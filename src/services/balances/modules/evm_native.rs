use std::collections::HashMap;
use std::str::FromStr;

use ethers::types::{Address, U256};

use super::{strip_hex_prefix, BalanceModule, StateQuery};
use crate::{
    config::Config,
    error::{AppError, Result},
    models::{BalanceEntry, BalanceModuleKind, ChainRef, Planck},
};

pub const NATIVE_TOKEN_ID: &str = "native";
const EVM_NATIVE_DECIMALS: u8 = 18;

/// Native coin balance via `eth_getBalance`.
pub struct EvmNativeModule {
    // network id -> native symbol
    networks: HashMap<String, String>,
}

impl EvmNativeModule {
    pub fn new(networks: HashMap<String, String>) -> Self {
        Self { networks }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .evm_networks
                .iter()
                .map(|network| (network.id.clone(), network.symbol.clone()))
                .collect(),
        )
    }
}

/// Parses a JSON-RPC hex quantity (`"0x1bc16d674ec80000"`).
pub(crate) fn parse_quantity(raw: &serde_json::Value) -> std::result::Result<U256, String> {
    let text = raw
        .as_str()
        .ok_or_else(|| format!("expected hex quantity, got {}", raw))?;
    let digits = strip_hex_prefix(text);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|e| format!("invalid hex quantity `{}`: {}", text, e))
}

impl BalanceModule for EvmNativeModule {
    fn kind(&self) -> BalanceModuleKind {
        BalanceModuleKind::EvmNative
    }

    fn supports(&self, chain: &ChainRef) -> bool {
        matches!(chain, ChainRef::Evm(id) if self.networks.contains_key(id))
    }

    fn build_queries(&self, chain: &ChainRef, addresses: &[String]) -> Vec<StateQuery> {
        addresses
            .iter()
            .filter_map(|address| {
                if Address::from_str(address).is_err() {
                    tracing::warn!("Skipping invalid EVM address {} on {}", address, chain);
                    return None;
                }
                Some(StateQuery {
                    method: "eth_getBalance".to_string(),
                    params: serde_json::json!([address, "latest"]),
                    address: address.clone(),
                    token_id: NATIVE_TOKEN_ID.to_string(),
                })
            })
            .collect()
    }

    fn decode(
        &self,
        chain: &ChainRef,
        query: &StateQuery,
        raw: &serde_json::Value,
    ) -> Result<BalanceEntry> {
        let free = parse_quantity(raw).map_err(|message| AppError::DecodeFailed {
            chain: chain.to_string(),
            module: self.kind().to_string(),
            message,
        })?;
        let symbol = self
            .networks
            .get(chain.id())
            .map(String::as_str)
            .unwrap_or("ETH");

        Ok(BalanceEntry::new(
            &query.address,
            chain.clone(),
            self.kind(),
            &query.token_id,
            symbol,
            EVM_NATIVE_DECIMALS,
        )
        .with_amounts(Planck::from(free), Planck::zero(), Planck::zero()))
    }
}
