// src/models/mod.rs
pub mod balance;
pub mod request;

pub use balance::{
    AggregateStatus, BalanceEntry, BalanceModuleKind, BalanceStatus, BalancesParams,
    BalancesUpdate, ChainRef, EvmAddressParams, Planck,
};
pub use request::{NewRequest, PendingRequest, RequestKind, RequestPayload};

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
