//! Unified API Response Format

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::idempotency::StoredResponse;
use crate::transfer::TransferError;

/// Header set on responses served from the idempotency cache
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Response code: 0 for success, non-zero for errors
    #[schema(example = 0)]
    pub code: i32,
    /// Response message
    #[schema(example = "ok")]
    pub msg: String,
    /// Response data (only present when code == 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4004;
    pub const IDEMPOTENCY_CONFLICT: i32 = 4009;
    pub const ACCOUNT_NOT_ACTIVE: i32 = 4022;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
}

/// JSON body of a successful response
pub fn success_body<T: Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(ApiResponse::success(data))
        .unwrap_or_else(|_| serde_json::json!({"code": error_codes::INTERNAL_ERROR, "msg": "Internal error"}))
}

/// JSON body of an error response; never carries server-side detail
pub fn error_body(err: &TransferError) -> serde_json::Value {
    serde_json::json!({
        "code": err.api_code(),
        "msg": err.public_message(),
    })
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match status.as_u16() {
            500..=599 => tracing::error!(code = self.code(), error = %self, "Request failed"),
            _ => tracing::debug!(code = self.code(), error = %self, "Request rejected"),
        }

        let mut headers = HeaderMap::new();
        if self == TransferError::RequestInFlight {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        (status, headers, Json(error_body(&self))).into_response()
    }
}

/// Serve a cached outcome verbatim, marked as a replay
pub fn replay_response(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(stored.body)).into_response();
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
