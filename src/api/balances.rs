use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::{
    error::Result,
    models::ApiResponse,
    services::balances::{subscription::ManagerStats, ChainHealthReport},
};

#[derive(Debug, Serialize)]
pub struct BalancesHealthResponse {
    pub subscriptions: ManagerStats,
    pub chains: Vec<ChainHealthReport>,
}

/// GET /api/v1/balances/health
pub async fn balances_health(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<BalancesHealthResponse>>> {
    Ok(Json(ApiResponse::success(BalancesHealthResponse {
        subscriptions: state.balances.stats(),
        chains: state.balances.chain_health(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support;

    #[tokio::test]
    async fn reports_every_configured_chain() {
        let state = test_support::state();
        let Json(response) = balances_health(State(state)).await.unwrap();
        assert_eq!(response.data.chains.len(), 2);
        assert_eq!(response.data.subscriptions.active_keys, 0);

        let json = serde_json::to_value(&response.data).unwrap();
        assert_eq!(json["chains"][0]["health"]["state"], "connecting");
    }
}
