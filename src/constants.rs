/// Application constants

// API version
pub const API_VERSION: &str = "v1";

// WebSocket configuration
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const WS_CLIENT_TIMEOUT_SECS: u64 = 60;

// Balances aggregator
pub const BALANCES_DEBOUNCE_MS_DEFAULT: u64 = 50;
pub const BALANCES_POLL_INTERVAL_MS_DEFAULT: u64 = 6_000;
pub const BALANCES_CACHE_HASH_KEY: &str = "wallet:balances";

// Chain connector
pub const RPC_TIMEOUT_MS_DEFAULT: u64 = 8_000;
pub const RPC_BREAKER_THRESHOLD_DEFAULT: u32 = 3;
pub const RPC_BREAKER_BASE_MS_DEFAULT: u64 = 2_000;
pub const RPC_BREAKER_MAX_MS_DEFAULT: u64 = 45_000;

// Dapp-facing JSON-RPC error codes (EIP-1193 / EIP-1474)
pub const RPC_CODE_USER_REJECTED: i64 = 4001;
pub const RPC_CODE_DISCONNECTED: i64 = 4900;
pub const RPC_CODE_RESOURCE_UNAVAILABLE: i64 = -32002;
pub const RPC_CODE_INTERNAL: i64 = -32603;

pub const USER_REJECTED_MESSAGE: &str = "User rejected the request.";
pub const DUPLICATE_REQUEST_MESSAGE: &str =
    "Pending request already exists for this site/asset. Please accept or reject the request.";

// Substrate storage prefix: twox128("System") ++ twox128("Account")
pub const SYSTEM_ACCOUNT_STORAGE_PREFIX: &str =
    "26aa394eea5630e07c48ae0c9558cef7b99d880ec681799c0cf30e8886371da9";
