// All service modules
pub mod balances;
pub mod chain_connector;
pub mod request_store;

// Re-export for convenience
pub use balances::{AggregatorSettings, BalancesAggregator, BalancesSubscription};
pub use chain_connector::{ChainConnector, ChainHealth, JsonRpcConnector};
pub use request_store::{RequestStore, RequestTicket};
