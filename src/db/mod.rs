use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::RwLock;

use crate::{config::Config, error::Result};

/// Last-known-good connection state of one chain, owned by the chain
/// connector. The aggregator only reads it to seed staleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ConnectionMeta {
    pub chain_id: String,
    pub priority_rpc: Option<String>,
    pub backoff_interval_ms: i64,
    pub consecutive_failures: i32,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionMeta {
    pub fn is_backing_off(&self) -> bool {
        self.backoff_interval_ms > 0
    }
}

#[async_trait]
pub trait ConnectionMetaStore: Send + Sync {
    async fn save(&self, meta: &ConnectionMeta) -> Result<()>;
    async fn load(&self, chain_id: &str) -> Result<Option<ConnectionMeta>>;
    async fn load_all(&self) -> Result<Vec<ConnectionMeta>>;
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let database_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ==================== CONNECTION META QUERIES ====================
#[async_trait]
impl ConnectionMetaStore for Database {
    async fn save(&self, meta: &ConnectionMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO chain_connection_meta
                (chain_id, priority_rpc, backoff_interval_ms, consecutive_failures, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id) DO UPDATE SET
                priority_rpc = EXCLUDED.priority_rpc,
                backoff_interval_ms = EXCLUDED.backoff_interval_ms,
                consecutive_failures = EXCLUDED.consecutive_failures,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&meta.chain_id)
        .bind(&meta.priority_rpc)
        .bind(meta.backoff_interval_ms)
        .bind(meta.consecutive_failures)
        .bind(meta.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, chain_id: &str) -> Result<Option<ConnectionMeta>> {
        let row = sqlx::query_as::<_, ConnectionMeta>(
            "SELECT chain_id, priority_rpc, backoff_interval_ms, consecutive_failures, updated_at
             FROM chain_connection_meta WHERE chain_id = $1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load_all(&self) -> Result<Vec<ConnectionMeta>> {
        let rows = sqlx::query_as::<_, ConnectionMeta>(
            "SELECT chain_id, priority_rpc, backoff_interval_ms, consecutive_failures, updated_at
             FROM chain_connection_meta ORDER BY chain_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryMetaStore {
    rows: RwLock<HashMap<String, ConnectionMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionMetaStore for MemoryMetaStore {
    async fn save(&self, meta: &ConnectionMeta) -> Result<()> {
        self.rows
            .write()
            .await
            .insert(meta.chain_id.clone(), meta.clone());
        Ok(())
    }

    async fn load(&self, chain_id: &str) -> Result<Option<ConnectionMeta>> {
        Ok(self.rows.read().await.get(chain_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<ConnectionMeta>> {
        let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(rows)
    }
}
