use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    RPC_CODE_DISCONNECTED, RPC_CODE_INTERNAL, RPC_CODE_RESOURCE_UNAVAILABLE,
    RPC_CODE_USER_REJECTED, USER_REJECTED_MESSAGE,
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    DuplicateRequest(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("{message}")]
    UserRejected { code: i64, message: String },

    #[error("Chain query failed on {chain}: {message}")]
    ChainQueryFailed { chain: String, message: String },

    #[error("Decode failed on {chain} ({module}): {message}")]
    DecodeFailed {
        chain: String,
        module: String,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// JSON-RPC style error object delivered to the calling dapp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn user_rejected() -> Self {
        Self {
            code: RPC_CODE_USER_REJECTED,
            message: USER_REJECTED_MESSAGE.to_string(),
        }
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        AppError::UserRejected {
            code: err.code,
            message: err.message,
        }
    }
}

impl AppError {
    /// Maps the error onto the shape surfaced to dapps over the transport.
    pub fn rpc_error(&self) -> RpcError {
        let code = match self {
            AppError::UserRejected { code, .. } => *code,
            AppError::DuplicateRequest(_) => RPC_CODE_RESOURCE_UNAVAILABLE,
            AppError::Cancelled(_) => RPC_CODE_DISCONNECTED,
            _ => RPC_CODE_INTERNAL,
        };
        RpcError {
            code,
            message: self.to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::DuplicateRequest(ref msg) => {
                (StatusCode::CONFLICT, "DUPLICATE_REQUEST", msg.clone())
            }
            AppError::RequestNotFound(ref id) => (
                StatusCode::NOT_FOUND,
                "REQUEST_NOT_FOUND",
                format!("No pending request with id {}", id),
            ),
            AppError::BadRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            AppError::Cancelled(ref msg) => (StatusCode::GONE, "CANCELLED", msg.clone()),
            AppError::Database(ref e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                e.to_string(),
            ),
            AppError::Redis(ref e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_ERROR",
                e.to_string(),
            ),
            AppError::ChainQueryFailed { .. } | AppError::DecodeFailed { .. } => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_RPC_ERROR",
                self.to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_rejection_keeps_eip1193_code() {
        let err: AppError = RpcError::user_rejected().into();
        let rpc = err.rpc_error();
        assert_eq!(rpc.code, 4001);
        assert_eq!(rpc.message, USER_REJECTED_MESSAGE);
    }

    #[test]
    fn duplicate_request_surfaces_plain_message() {
        let err = AppError::DuplicateRequest("already pending".to_string());
        let rpc = err.rpc_error();
        assert_eq!(rpc.code, RPC_CODE_RESOURCE_UNAVAILABLE);
        assert_eq!(rpc.message, "already pending");
    }

    #[test]
    fn unknown_failures_map_to_internal_code() {
        let err = AppError::Internal("boom".to_string());
        assert_eq!(err.rpc_error().code, RPC_CODE_INTERNAL);
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = AppError::RequestNotFound("auth.1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
