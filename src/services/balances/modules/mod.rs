//! Pluggable per-token-type balance fetchers.
//!
//! A module turns `(chain, addresses)` into raw state queries and turns each
//! raw result into a `BalanceEntry`. Networking belongs to the chain
//! connector; modules never talk to an RPC node themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    config::Config,
    error::Result,
    models::{BalanceEntry, BalanceModuleKind, ChainRef},
};

pub mod evm_erc20;
pub mod evm_native;
pub mod substrate_native;

pub use evm_erc20::EvmErc20Module;
pub use evm_native::EvmNativeModule;
pub use substrate_native::SubstrateNativeModule;

/// One RPC call plus what it is asking about.
#[derive(Debug, Clone, PartialEq)]
pub struct StateQuery {
    pub method: String,
    pub params: serde_json::Value,
    pub address: String,
    pub token_id: String,
}

pub trait BalanceModule: Send + Sync {
    fn kind(&self) -> BalanceModuleKind;

    fn supports(&self, chain: &ChainRef) -> bool;

    /// Queries covering every `(address, token)` pair this module tracks on
    /// `chain`. Addresses the module cannot parse are skipped.
    fn build_queries(&self, chain: &ChainRef, addresses: &[String]) -> Vec<StateQuery>;

    fn decode(
        &self,
        chain: &ChainRef,
        query: &StateQuery,
        raw: &serde_json::Value,
    ) -> Result<BalanceEntry>;
}

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<BalanceModuleKind, Arc<dyn BalanceModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn BalanceModule>) {
        self.modules.insert(module.kind(), module);
    }

    pub fn with(mut self, module: Arc<dyn BalanceModule>) -> Self {
        self.register(module);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with(Arc::new(SubstrateNativeModule::from_config(config)))
            .with(Arc::new(EvmNativeModule::from_config(config)))
            .with(Arc::new(EvmErc20Module::from_config(config)))
    }

    pub fn get(&self, kind: BalanceModuleKind) -> Option<Arc<dyn BalanceModule>> {
        self.modules.get(&kind).cloned()
    }

    /// Modules able to serve `chain`, in kind order.
    pub fn for_chain(&self, chain: &ChainRef) -> Vec<Arc<dyn BalanceModule>> {
        self.modules
            .values()
            .filter(|module| module.supports(chain))
            .cloned()
            .collect()
    }

    pub fn kinds(&self) -> Vec<BalanceModuleKind> {
        self.modules.keys().copied().collect()
    }
}

// Internal helper that supports hex quantity decoding for EVM modules.
pub(crate) fn strip_hex_prefix(raw: &str) -> &str {
    raw.strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw)
}
