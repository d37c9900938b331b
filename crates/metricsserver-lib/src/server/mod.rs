//! HTTP surface of the metrics server
//!
//! Two routers are exposed: the ingestion router accepting envelope streams
//! over WebSocket, and the query router answering metric history requests
//! or redirecting them to the owning node.

mod metric_handler;
mod ws;

pub use metric_handler::{query_router, MetricQuerier, QueryState, METRIC_HISTORIES_PATH};
pub use ws::{ingestion_router, IngestionState, ENVELOPES_PATH, KEEP_ALIVE_EXPIRED_REASON};

use crate::models::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Error codes carried in JSON error bodies
pub const CODE_BAD_REQUEST: &str = "Bad-Request";
pub const CODE_INTERNAL_SERVER_ERROR: &str = "Internal-Server-Error";

/// Errors returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, CODE_BAD_REQUEST, message)
            }
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_INTERNAL_SERVER_ERROR,
                message,
            ),
        };

        let body = ErrorResponse {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
