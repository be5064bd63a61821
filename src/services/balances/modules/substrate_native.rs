use std::collections::HashMap;

use blake2::{digest::consts::U16, Blake2b, Blake2b512, Digest};

use super::{BalanceModule, StateQuery};
use crate::{
    config::Config,
    constants::SYSTEM_ACCOUNT_STORAGE_PREFIX,
    error::{AppError, Result},
    models::{BalanceEntry, BalanceModuleKind, ChainRef, Planck},
};

pub const NATIVE_TOKEN_ID: &str = "native";

// AccountData flag marking the frozen/flags layout (vs misc_frozen/fee_frozen).
const NEW_LOGIC_FLAG: u128 = 1 << 127;
const ACCOUNT_DATA_LEN: usize = 64;
const SS58_PREFIX: &[u8] = b"SS58PRE";

#[derive(Debug, Clone)]
struct NativeToken {
    symbol: String,
    decimals: u8,
}

/// Native token of a substrate chain, read from `System.Account` storage.
pub struct SubstrateNativeModule {
    chains: HashMap<String, NativeToken>,
}

impl SubstrateNativeModule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chains: config
                .substrate_chains
                .iter()
                .map(|chain| {
                    (
                        chain.id.clone(),
                        NativeToken {
                            symbol: chain.symbol.clone(),
                            decimals: chain.decimals,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Raw 32-byte account id from an SS58 address or `0x`-prefixed hex.
pub fn decode_account_id(address: &str) -> std::result::Result<[u8; 32], String> {
    let address = address.trim();
    if let Some(hex_part) = address.strip_prefix("0x") {
        let bytes = hex::decode(hex_part).map_err(|e| format!("invalid hex account: {}", e))?;
        return bytes
            .try_into()
            .map_err(|_| "hex account must be 32 bytes".to_string());
    }

    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|e| format!("invalid ss58 address: {}", e))?;
    let prefix_len = match raw.first().copied() {
        Some(0..=63) => 1,
        Some(64..=127) => 2,
        _ => return Err("invalid ss58 prefix".to_string()),
    };
    if raw.len() != prefix_len + 32 + 2 {
        return Err(format!("unsupported ss58 length {}", raw.len()));
    }

    let (body, checksum) = raw.split_at(raw.len() - 2);
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_PREFIX);
    hasher.update(body);
    let digest = hasher.finalize();
    if digest[..2] != *checksum {
        return Err("ss58 checksum mismatch".to_string());
    }

    body[prefix_len..]
        .try_into()
        .map_err(|_| "ss58 account must be 32 bytes".to_string())
}

/// `System.Account` storage key: pallet prefix + blake2_128_concat(account).
pub fn account_storage_key(account: &[u8; 32]) -> String {
    let hash = Blake2b::<U16>::digest(account);
    format!(
        "0x{}{}{}",
        SYSTEM_ACCOUNT_STORAGE_PREFIX,
        hex::encode(hash),
        hex::encode(account)
    )
}

fn read_u128(bytes: &[u8]) -> u128 {
    let mut word = [0u8; 16];
    word.copy_from_slice(&bytes[..16]);
    u128::from_le_bytes(word)
}

/// `(free, reserved, frozen)` from SCALE-encoded `AccountInfo`.
///
/// `AccountData` is always the trailing 64 bytes, whatever the nonce and
/// refcount fields in front of it look like on a given runtime.
pub fn decode_account_data(bytes: &[u8]) -> std::result::Result<(u128, u128, u128), String> {
    if bytes.len() < ACCOUNT_DATA_LEN {
        return Err(format!("AccountInfo too short: {} bytes", bytes.len()));
    }
    let data = &bytes[bytes.len() - ACCOUNT_DATA_LEN..];
    let free = read_u128(&data[0..]);
    let reserved = read_u128(&data[16..]);
    let third = read_u128(&data[32..]);
    let fourth = read_u128(&data[48..]);

    let frozen = if fourth & NEW_LOGIC_FLAG != 0 {
        third
    } else {
        // misc_frozen / fee_frozen
        third.max(fourth)
    };
    Ok((free, reserved, frozen))
}

impl BalanceModule for SubstrateNativeModule {
    fn kind(&self) -> BalanceModuleKind {
        BalanceModuleKind::SubstrateNative
    }

    fn supports(&self, chain: &ChainRef) -> bool {
        matches!(chain, ChainRef::Substrate(id) if self.chains.contains_key(id))
    }

    fn build_queries(&self, chain: &ChainRef, addresses: &[String]) -> Vec<StateQuery> {
        addresses
            .iter()
            .filter_map(|address| match decode_account_id(address) {
                Ok(account) => Some(StateQuery {
                    method: "state_getStorage".to_string(),
                    params: serde_json::json!([account_storage_key(&account)]),
                    address: address.clone(),
                    token_id: NATIVE_TOKEN_ID.to_string(),
                }),
                Err(err) => {
                    tracing::warn!("Skipping address {} on {}: {}", address, chain, err);
                    None
                }
            })
            .collect()
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
            .chains
            .get(chain.id())
            .ok_or_else(|| fail("chain not configured".to_string()))?;
        let entry = BalanceEntry::new(
            &query.address,
            chain.clone(),
            self.kind(),
            &query.token_id,
            &token.symbol,
            token.decimals,
        );

        // Accounts that never existed have no storage.
        if raw.is_null() {
            return Ok(entry);
        }

        let text = raw
            .as_str()
            .ok_or_else(|| fail(format!("expected hex storage, got {}", raw)))?;
        let bytes = hex::decode(text.trim_start_matches("0x"))
            .map_err(|e| fail(format!("invalid hex: {}", e)))?;
        let (free, reserved, frozen) = decode_account_data(&bytes).map_err(fail)?;

        Ok(entry.with_amounts(
            Planck::from(free),
            Planck::from(reserved),
            Planck::from(frozen),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
    const ALICE_PUBKEY: &str = "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";

    fn module() -> SubstrateNativeModule {
        SubstrateNativeModule::from_config(&crate::config::test_config())
    }

    fn account_info(free: u128, reserved: u128, third: u128, fourth: u128) -> String {
        // nonce, consumers, providers, sufficients
        let mut bytes = vec![0u8; 16];
        for value in [free, reserved, third, fourth] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn ss58_decodes_to_public_key() {
        let account = decode_account_id(ALICE).unwrap();
        assert_eq!(hex::encode(account), ALICE_PUBKEY);
    }

    #[test]
    fn hex_account_ids_are_accepted() {
        let account = decode_account_id(&format!("0x{}", ALICE_PUBKEY)).unwrap();
        assert_eq!(hex::encode(account), ALICE_PUBKEY);
    }

    #[test]
    fn ss58_checksum_is_verified() {
        // last character changed
        assert!(decode_account_id("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQZ").is_err());
    }

    #[test]
    fn storage_key_matches_known_alice_key() {
        let account = decode_account_id(ALICE).unwrap();
        assert_eq!(
            account_storage_key(&account),
            format!(
                "0x{}de1e86a9a8c739864cf3cc5ec2bea59f{}",
                SYSTEM_ACCOUNT_STORAGE_PREFIX, ALICE_PUBKEY
            )
        );
    }

    #[test]
    fn frozen_uses_flags_layout_when_new_logic_bit_set() {
        let hex_info = account_info(1_000, 10, 300, NEW_LOGIC_FLAG);
        let bytes = hex::decode(hex_info.trim_start_matches("0x")).unwrap();
        assert_eq!(decode_account_data(&bytes).unwrap(), (1_000, 10, 300));
    }

    #[test]
    fn frozen_is_max_of_legacy_locks() {
        let hex_info = account_info(1_000, 0, 200, 500);
        let bytes = hex::decode(hex_info.trim_start_matches("0x")).unwrap();
        assert_eq!(decode_account_data(&bytes).unwrap(), (1_000, 0, 500));
    }

    #[test]
    fn decode_builds_entry_with_transferable() {
        let chain = ChainRef::Substrate("polkadot".to_string());
        let m = module();
        let query = m.build_queries(&chain, &[ALICE.to_string()]).remove(0);
        assert_eq!(query.method, "state_getStorage");

        let raw = serde_json::json!(account_info(1_000, 10, 300, NEW_LOGIC_FLAG));
        let entry = m.decode(&chain, &query, &raw).unwrap();
        assert_eq!(entry.free, Planck::from(1_000u128));
        assert_eq!(entry.reserved, Planck::from(10u128));
        assert_eq!(entry.transferable, Planck::from(700u128));
        assert_eq!(entry.symbol, "DOT");
    }

    #[test]
    fn missing_storage_is_a_zero_balance() {
        let chain = ChainRef::Substrate("polkadot".to_string());
        let m = module();
        let query = m.build_queries(&chain, &[ALICE.to_string()]).remove(0);
        let entry = m.decode(&chain, &query, &serde_json::Value::Null).unwrap();
        assert_eq!(entry.free, Planck::zero());
    }

    #[test]
    fn truncated_storage_is_a_decode_failure() {
        let chain = ChainRef::Substrate("polkadot".to_string());
        let m = module();
        let query = m.build_queries(&chain, &[ALICE.to_string()]).remove(0);
        let err = m
            .decode(&chain, &query, &serde_json::json!("0x0102"))
            .unwrap_err();
        assert!(matches!(err, AppError::DecodeFailed { .. }));
    }

    #[test]
    fn invalid_addresses_are_skipped() {
        let chain = ChainRef::Substrate("polkadot".to_string());
        let queries = module().build_queries(&chain, &["garbage".to_string(), ALICE.to_string()]);
        assert_eq!(queries.len(), 1);
    }
}
