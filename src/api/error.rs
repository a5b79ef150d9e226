//! Errors surfaced to WebDriver clients.
//!
//! Every gateway-generated error is a single JSON object in the shape
//! Selenium tooling expects:
//!
//! ```json
//! {"code": 400, "value": {"message": "unknown browser name foo"}}
//! ```
//!
//! The message is always safe prose; upstream driver errors are relayed
//! verbatim by the proxy and never pass through this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// 400 - malformed capabilities, unknown browser, bad request body.
    InvalidArgument(String),
    /// 400 - the path's session id is missing or malformed.
    InvalidSessionId,
    /// 500 - pod could not be created or never became ready.
    SessionNotCreated(String),
    /// 500 - every session-creation attempt ran out of time.
    RetryExceeded,
    /// 500 - the upstream response body could not be decoded.
    UpstreamResponse,
    /// 500 - catch-all.
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidSessionId => StatusCode::BAD_REQUEST,
            ApiError::SessionNotCreated(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RetryExceeded => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::UpstreamResponse => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidArgument(detail) => detail.clone(),
            ApiError::InvalidSessionId => "session id not found".to_string(),
            ApiError::SessionNotCreated(detail) => detail.clone(),
            ApiError::RetryExceeded => "New session attempts retry count exceeded".to_string(),
            ApiError::UpstreamResponse => "Failed to read service response".to_string(),
            ApiError::Internal(detail) => detail.clone(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "code": status.as_u16(),
            "value": {"message": self.message()},
        });
        (status, Json(body)).into_response()
    }
}
