use ethers::types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ==================== CHAIN ====================
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum ChainRef {
    Substrate(String),
    Evm(String),
}

impl ChainRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Substrate(id) | Self::Evm(id) => id,
        }
    }

    pub fn is_evm(&self) -> bool {
        matches!(self, Self::Evm(_))
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substrate(id) => write!(f, "substrate:{}", id),
            Self::Evm(id) => write!(f, "evm:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceModuleKind {
    SubstrateNative,
    EvmNative,
    EvmErc20,
}

impl fmt::Display for BalanceModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SubstrateNative => "substrate-native",
            Self::EvmNative => "evm-native",
            Self::EvmErc20 => "evm-erc20",
        })
    }
}

// ==================== AMOUNTS ====================
/// Token amount in its smallest unit, carried as a decimal string on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Planck(pub U256);

impl Planck {
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl From<u128> for Planck {
    fn from(value: u128) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for Planck {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl FromStr for Planck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_dec_str(s.trim())
            .map(Self)
            .map_err(|e| format!("invalid planck amount `{}`: {:?}", s, e))
    }
}

impl fmt::Display for Planck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Planck {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Planck {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// ==================== BALANCE ENTRY ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStatus {
    Cache,
    Live,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub id: String,
    pub address: String,
    pub source: ChainRef,
    pub module: BalanceModuleKind,
    pub token_id: String,
    pub symbol: String,
    pub decimals: u8,
    pub status: BalanceStatus,
    pub free: Planck,
    pub reserved: Planck,
    pub frozen: Planck,
    pub transferable: Planck,
}

impl BalanceEntry {
    /// Zero-valued live entry for `(address, source, token_id)`.
    pub fn new(
        address: &str,
        source: ChainRef,
        module: BalanceModuleKind,
        token_id: &str,
        symbol: &str,
        decimals: u8,
    ) -> Self {
        let address = normalize_address(&source, address);
        Self {
            id: Self::balance_id(&address, &source, token_id),
            address,
            source,
            module,
            token_id: token_id.to_string(),
            symbol: symbol.to_string(),
            decimals,
            status: BalanceStatus::Live,
            free: Planck::zero(),
            reserved: Planck::zero(),
            frozen: Planck::zero(),
            transferable: Planck::zero(),
        }
    }

    pub fn with_amounts(mut self, free: Planck, reserved: Planck, frozen: Planck) -> Self {
        self.free = free;
        self.reserved = reserved;
        self.frozen = frozen;
        self.transferable = free.saturating_sub(frozen);
        self
    }

    pub fn with_status(mut self, status: BalanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Stable id: `<address>-<chain kind>:<chain id>-<token id>`. The kind
    /// keeps a substrate chain and an EVM network with the same id apart.
    pub fn balance_id(address: &str, source: &ChainRef, token_id: &str) -> String {
        format!("{}-{}-{}", address, source, token_id)
    }
}

/// EVM addresses are case-insensitive; SS58 addresses are not.
pub fn normalize_address(source: &ChainRef, address: &str) -> String {
    let trimmed = address.trim();
    if source.is_evm() {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    }
}

// ==================== UPDATES ====================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BalancesUpdate {
    Reset {
        balances: Vec<BalanceEntry>,
    },
    Upsert {
        balances: Vec<BalanceEntry>,
    },
    Delete {
        #[serde(rename = "balanceIds")]
        balance_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Live,
    Fetching,
    Stale,
}

// ==================== PARAMS ====================
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmAddressParams {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
}

/// Which addresses to watch on which substrate chains and EVM networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesParams {
    #[serde(default)]
    pub chain_addresses: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub evm_addresses: EvmAddressParams,
}

impl BalancesParams {
    /// Chain -> sorted, deduplicated, normalized addresses. Chains without
    /// addresses are dropped.
    pub fn targets(&self) -> BTreeMap<ChainRef, Vec<String>> {
        let mut targets: BTreeMap<ChainRef, Vec<String>> = BTreeMap::new();

        for (chain_id, addresses) in &self.chain_addresses {
            let chain_id = chain_id.trim();
            if chain_id.is_empty() {
                continue;
            }
            let chain = ChainRef::Substrate(chain_id.to_string());
            let list = targets.entry(chain.clone()).or_default();
            list.extend(
                addresses
                    .iter()
                    .map(|a| normalize_address(&chain, a))
                    .filter(|a| !a.is_empty()),
            );
        }

        for network_id in &self.evm_addresses.networks {
            let network_id = network_id.trim();
            if network_id.is_empty() {
                continue;
            }
            let chain = ChainRef::Evm(network_id.to_string());
            let list = targets.entry(chain.clone()).or_default();
            list.extend(
                self.evm_addresses
                    .addresses
                    .iter()
                    .map(|a| normalize_address(&chain, a))
                    .filter(|a| !a.is_empty()),
            );
        }

        targets.retain(|_, addresses| {
            addresses.sort();
            addresses.dedup();
            !addresses.is_empty()
        });
        targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planck_serializes_as_decimal_string() {
        let amount = Planck::from(1_000_000_000_000u128);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"1000000000000\"");
        let back: Planck = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn planck_handles_values_beyond_u128() {
        let raw = "340282366920938463463374607431768211456"; // 2^128
        let amount: Planck = raw.parse().unwrap();
        assert_eq!(amount.to_string(), raw);
    }

    #[test]
    fn entry_id_is_address_chain_token() {
        let entry = BalanceEntry::new(
            "5F3sa2TJAWMqDhXG6jhV4N8ko9SxwGy8TpaNS1repo5EYjQX",
            ChainRef::Substrate("polkadot".to_string()),
            BalanceModuleKind::SubstrateNative,
            "native",
            "DOT",
            10,
        );
        assert_eq!(
            entry.id,
            "5F3sa2TJAWMqDhXG6jhV4N8ko9SxwGy8TpaNS1repo5EYjQX-substrate:polkadot-native"
        );
    }

    #[test]
    fn entry_ids_do_not_collide_across_chain_kinds() {
        let on = |chain: ChainRef| {
            BalanceEntry::new("0xabc", chain, BalanceModuleKind::EvmNative, "native", "X", 18).id
        };
        let substrate = on(ChainRef::Substrate("1".to_string()));
        let evm = on(ChainRef::Evm("1".to_string()));
        assert_ne!(substrate, evm);
        assert_eq!(evm, "0xabc-evm:1-native");
    }

    #[test]
    fn transferable_saturates_at_zero() {
        let entry = BalanceEntry::new(
            "0xABC",
            ChainRef::Evm("1".to_string()),
            BalanceModuleKind::EvmNative,
            "native",
            "ETH",
            18,
        )
        .with_amounts(Planck::from(5u128), Planck::zero(), Planck::from(9u128));
        assert_eq!(entry.address, "0xabc");
        assert_eq!(entry.transferable, Planck::zero());
    }

    #[test]
    fn unknown_update_tag_is_rejected() {
        let raw = serde_json::json!({"type": "patch", "balances": []});
        assert!(serde_json::from_value::<BalancesUpdate>(raw).is_err());
    }

    #[test]
    fn delete_update_uses_balance_ids_field() {
        let update = BalancesUpdate::Delete {
            balance_ids: vec!["a".to_string()],
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({"type": "delete", "balanceIds": ["a"]}));
    }

    #[test]
    fn targets_normalize_and_drop_empty_chains() {
        let mut params = BalancesParams::default();
        params
            .chain_addresses
            .insert("polkadot".to_string(), vec!["5F3s".to_string(), "5F3s".to_string()]);
        params.chain_addresses.insert("kusama".to_string(), vec![]);
        params.evm_addresses = EvmAddressParams {
            addresses: vec!["0xABC".to_string(), "0xabc".to_string()],
            networks: vec!["1".to_string()],
        };

        let targets = params.targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(
            targets[&ChainRef::Substrate("polkadot".to_string())],
            vec!["5F3s".to_string()]
        );
        assert_eq!(
            targets[&ChainRef::Evm("1".to_string())],
            vec!["0xabc".to_string()]
        );
    }
}
