// src/api/mod.rs

pub mod balances;
pub mod health;
pub mod requests;

use crate::config::Config;
use crate::db::Database;
use crate::services::{BalancesAggregator, RequestStore};

// AppState definition
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub requests: RequestStore,
    pub balances: BalancesAggregator,
    pub db: Option<Database>,
    pub redis: Option<redis::aio::ConnectionManager>,
}
