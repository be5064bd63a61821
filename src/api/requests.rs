use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::{
    constants::RPC_CODE_USER_REJECTED,
    error::{Result, RpcError},
    models::{ApiResponse, PendingRequest},
};

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub code: Option<i64>,
    pub message: Option<String>,
}

impl RejectRequest {
    fn into_rpc_error(self) -> RpcError {
        let default = RpcError::user_rejected();
        RpcError {
            code: self.code.unwrap_or(RPC_CODE_USER_REJECTED),
            message: self
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(default.message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettledResponse {
    pub id: String,
    pub outcome: &'static str,
}

/// GET /api/v1/requests?type=auth
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<ApiResponse<Vec<PendingRequest>>>> {
    let filter = query.kind.as_deref().map(str::trim).filter(|k| !k.is_empty());
    Ok(Json(ApiResponse::success(
        state.requests.get_all_requests(filter),
    )))
}

/// GET /api/v1/requests/counts
pub async fn request_counts(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<BTreeMap<String, usize>>>> {
    let counts = state
        .requests
        .counts()
        .into_iter()
        .map(|(kind, count)| (kind.to_string(), count))
        .collect();
    Ok(Json(ApiResponse::success(counts)))
}

/// POST /api/v1/requests/{id}/approve
pub async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveRequest>,
) -> Result<Json<ApiResponse<SettledResponse>>> {
    state.requests.resolve(&id, body.value)?;
    Ok(Json(ApiResponse::success(SettledResponse {
        id,
        outcome: "approved",
    })))
}

/// POST /api/v1/requests/{id}/reject
pub async fn reject_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> Result<Json<ApiResponse<SettledResponse>>> {
    let reason = body.map(|Json(b)| b).unwrap_or_default();
    state.requests.reject(&id, reason.into_rpc_error())?;
    Ok(Json(ApiResponse::success(SettledResponse {
        id,
        outcome: "rejected",
    })))
}
