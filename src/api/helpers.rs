// Shared plumbing for the query handlers.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

/// Standard result type for API handlers.
pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn not_found(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError::new(message)))
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
}

pub fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
}

/// Map a store read failure onto a response: missing rows are 404,
/// anything else is a server fault.
pub fn store_error(err: Error) -> (StatusCode, Json<ApiError>) {
    if err.is_not_found() {
        not_found("not found")
    } else {
        internal_error(err.to_string())
    }
}
