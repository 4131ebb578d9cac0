//! Typed error → `IntoResponse` mapping.
//!
//! `AppError` lives in `flowreader-core` and `IntoResponse` lives in `axum`;
//! neither is local to this crate, so the orphan rule requires a local
//! wrapper to bridge them (mirrors `hdds-gateway/handlers.rs`'s `ApiError`).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowreader_core::error::AppError;
use serde_json::json;

pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // 5xx kinds are opaque to the caller (§7 "User-visible behavior");
        // everything else describes a caller-fixable condition.
        let message = if err.is_user_facing() {
            err.to_string()
        } else {
            "internal error".to_string()
        };

        let mut response = (
            status,
            Json(json!({ "code": err.code(), "message": message })),
        )
            .into_response();

        if let AppError::RateLimited {
            retry_after_seconds,
        } = &err
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
