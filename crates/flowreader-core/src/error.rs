//! Root error taxonomy.
//!
//! Every fallible operation in this crate eventually returns `AppError` (or a
//! component-local error with a `From` conversion into it). The gateway maps
//! each variant to a stable HTTP status and machine-readable code; nothing
//! downstream of a handler needs to know about status codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("caller lacks the required capability")]
    Forbidden,

    #[error("resource not found")]
    NotFound,

    #[error("validation failed on field `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("semantic conflict: {0}")]
    UnprocessableEntity(String),

    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("book is still processing")]
    NotReady,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream dependency failure: {0}")]
    Upstream(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code, independent of the display message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound => "NOT_FOUND",
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::NotReady => "NOT_READY",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Upstream(_) => "UPSTREAM",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status this error kind maps to (§4.14 of the error mapping table).
    pub fn status_u16(&self) -> u16 {
        match self {
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound => 404,
            AppError::Validation { .. } => 400,
            AppError::UnprocessableEntity(_) => 422,
            AppError::RateLimited { .. } => 429,
            AppError::NotReady => 409,
            AppError::Conflict(_) => 409,
            AppError::Upstream(_) => 502,
            AppError::Internal(_) => 500,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether `message`/`details` are safe to show verbatim to the caller.
    /// 5xx kinds are opaque per the error handling policy; everything else
    /// describes a caller-fixable condition.
    pub fn is_user_facing(&self) -> bool {
        self.status_u16() < 500
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Upstream(other.to_string()),
        }
    }
}
