use axum::{extract::State, Json};
use serde::Serialize;
use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub redis: String,
    pub pending_requests: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    // Database is optional; without it connection meta lives in memory.
    let db_status = match &state.db {
        Some(db) => {
            if db.pool().acquire().await.is_ok() {
                "connected"
            } else {
                "disconnected"
            }
        }
        None => "memory",
    };

    let redis_status = match state.redis.clone() {
        Some(mut conn) => {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            if pong.is_ok() {
                "connected"
            } else {
                "disconnected"
            }
        }
        None => "memory",
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status.to_string(),
        redis: redis_status.to_string(),
        pending_requests: state.requests.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support;

    #[tokio::test]
    async fn reports_memory_backends_when_unconfigured() {
        let Json(health) = health_check(State(test_support::state())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.database, "memory");
        assert_eq!(health.redis, "memory");
        assert_eq!(health.pending_requests, 0);
    }
}
