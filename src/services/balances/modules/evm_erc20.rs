use std::collections::HashMap;
use std::str::FromStr;

use ethers::{
    abi::{encode, Token},
    types::{Address, U256},
    utils::id,
};

use super::{strip_hex_prefix, BalanceModule, StateQuery};
use crate::{
    config::{Config, Erc20TokenConfig},
    error::{AppError, Result},
    models::{BalanceEntry, BalanceModuleKind, ChainRef, Planck},
};

const TOKEN_ID_PREFIX: &str = "erc20-";

/// `balanceOf(address)` through `eth_call` for every configured token.
pub struct EvmErc20Module {
    // network id -> tracked tokens
    tokens: HashMap<String, Vec<Erc20TokenConfig>>,
}

impl EvmErc20Module {
    pub fn new(tokens: HashMap<String, Vec<Erc20TokenConfig>>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .evm_networks
                .iter()
                .filter(|network| !network.erc20_tokens.is_empty())
                .map(|network| (network.id.clone(), network.erc20_tokens.clone()))
                .collect(),
        )
    }

    pub fn token_id(contract: &str) -> String {
        format!("{}{}", TOKEN_ID_PREFIX, contract.to_ascii_lowercase())
    }

    fn token(&self, chain: &ChainRef, token_id: &str) -> Option<&Erc20TokenConfig> {
        let contract = token_id.strip_prefix(TOKEN_ID_PREFIX)?;
        self.tokens
            .get(chain.id())?
            .iter()
            .find(|token| token.address.eq_ignore_ascii_case(contract))
    }
}

/// ABI calldata for `balanceOf(owner)`.
pub(crate) fn balance_of_calldata(owner: Address) -> String {
    let mut data = id("balanceOf(address)").to_vec();
    data.extend(encode(&[Token::Address(owner)]));
    format!("0x{}", hex::encode(data))
}

impl BalanceModule for EvmErc20Module {
    fn kind(&self) -> BalanceModuleKind {
        BalanceModuleKind::EvmErc20
    }

    fn supports(&self, chain: &ChainRef) -> bool {
        matches!(chain, ChainRef::Evm(id) if self.tokens.contains_key(id))
    }

    fn build_queries(&self, chain: &ChainRef, addresses: &[String]) -> Vec<StateQuery> {
        let Some(tokens) = self.tokens.get(chain.id()) else {
            return Vec::new();
        };

        let mut queries = Vec::with_capacity(tokens.len() * addresses.len());
        for address in addresses {
            let Ok(owner) = Address::from_str(address) else {
                tracing::warn!("Skipping invalid EVM address {} on {}", address, chain);
                continue;
            };
            let data = balance_of_calldata(owner);
            for token in tokens {
                queries.push(StateQuery {
                    method: "eth_call".to_string(),
                    params: serde_json::json!([{ "to": token.address, "data": data }, "latest"]),
                    address: address.clone(),
                    token_id: Self::token_id(&token.address),
                });
            }
        }
        queries
    }

    fn decode(
        &self,
        chain: &ChainRef,
        query: &StateQuery,
        raw: &serde_json::Value,
    ) -> Result<BalanceEntry> {
        let fail = |message: String| AppError::DecodeFailed {
            chain: chain.to_string(),
            module: self.kind().to_string(),
            message,
        };

        let token = self
            .token(chain, &query.token_id)
            .ok_or_else(|| fail(format!("unknown token {}", query.token_id)))?;
        let text = raw
            .as_str()
            .ok_or_else(|| fail(format!("expected hex bytes, got {}", raw)))?;
        let bytes =
            hex::decode(strip_hex_prefix(text)).map_err(|e| fail(format!("invalid hex: {}", e)))?;
        // A contract without balanceOf answers `0x`.
        if bytes.is_empty() || bytes.len() > 32 {
            return Err(fail(format!("unexpected balanceOf result `{}`", text)));
        }
        let free = U256::from_big_endian(&bytes);

        Ok(BalanceEntry::new(
            &query.address,
            chain.clone(),
            self.kind(),
            &query.token_id,
            &token.symbol,
            token.decimals,
        )
        .with_amounts(Planck::from(free), Planck::zero(), Planck::zero()))
    }
}
