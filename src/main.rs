use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod config;
mod constants;
mod db;
mod error;
mod models;
mod services;
mod websocket;

use cache::{BalanceCache, MemoryBalanceCache, RedisBalanceCache};
use config::Config;
use constants::API_VERSION;
use db::{ConnectionMetaStore, Database, MemoryMetaStore};
use services::balances::modules::ModuleRegistry;
use services::{AggregatorSettings, BalancesAggregator, JsonRpcConnector, RequestStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wallet_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting wallet bridge");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("API Version: {}", API_VERSION);

    // Connection metadata: Postgres when configured, memory otherwise
    let db = match config.database_url {
        Some(_) => {
            let db = Database::new(&config).await?;
            tracing::info!("Running database migrations...");
            db.run_migrations().await?;
            Some(db)
        }
        None => None,
    };
    let meta: Arc<dyn ConnectionMetaStore> = match &db {
        Some(db) => Arc::new(db.clone()),
        None => Arc::new(MemoryMetaStore::new()),
    };

    // Balance cache: Redis when configured, memory otherwise
    let redis_manager = match config.redis_url.as_deref() {
        Some(url) => {
            let client = redis::Client::open(url)?;
            Some(redis::aio::ConnectionManager::new(client).await?)
        }
        None => None,
    };
    let cache: Arc<dyn BalanceCache> = match &redis_manager {
        Some(conn) => Arc::new(RedisBalanceCache::new(conn.clone())),
        None => Arc::new(MemoryBalanceCache::new()),
    };

    let connector = JsonRpcConnector::from_config(&config, meta.clone())?;
    if let Err(err) = connector.restore_priorities().await {
        tracing::warn!("Could not restore RPC priorities: {}", err);
    }

    let balances = BalancesAggregator::new(
        Arc::new(connector),
        ModuleRegistry::from_config(&config),
        cache,
        meta,
        AggregatorSettings::from_config(&config),
    );
    let requests = RequestStore::new();

    let app_state = api::AppState {
        config: config.clone(),
        requests: requests.clone(),
        balances,
        db,
        redis: redis_manager,
    };

    // Build router
    let app = build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Nobody is left to answer; release every waiting dapp.
    let cancelled = requests.cancel_all("server shutting down");
    tracing::info!("Shutdown complete, cancelled {} pending request(s)", cancelled);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn build_router(state: api::AppState) -> Router {
    // CORS configuration
    let cors = cors_from_config(&state.config);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Approval queue
        .route("/api/v1/requests", get(api::requests::list_requests))
        .route("/api/v1/requests/counts", get(api::requests::request_counts))
        .route(
            "/api/v1/requests/{id}/approve",
            post(api::requests::approve_request),
        )
        .route(
            "/api/v1/requests/{id}/reject",
            post(api::requests::reject_request),
        )
        // Balances
        .route(
            "/api/v1/balances/health",
            get(api::balances::balances_health),
        )
        // WebSocket endpoints
        .route("/ws/dapp", get(websocket::dapp::handler))
        .route("/ws/requests", get(websocket::requests::handler))
        .route("/ws/balances", get(websocket::balances::handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_from_config(config: &Config) -> CorsLayer {
    let raw = config.cors_allowed_origins.trim();
    if raw.is_empty() || raw == "*" {
        return CorsLayer::very_permissive();
    }

    let allowed: Vec<HeaderValue> = config::parse_list(raw)
        .iter()
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return CorsLayer::very_permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}
