use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use flare_core::TokenValidationError;
use serde::Serialize;
use thiserror::Error;

/// Identity resolution failed; the connection is rejected before it is ever
/// registered.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session token presented")]
    MissingToken,
    #[error("session token is malformed")]
    MalformedToken,
    #[error("session token is unknown")]
    UnknownToken,
    #[error("session token rejected: {0}")]
    Expired(#[from] TokenValidationError),
    #[error("account store unavailable: {0}")]
    Store(#[from] AccountError),
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken => "malformed_token",
            AuthError::UnknownToken => "unknown_token",
            AuthError::Expired(_) => "token_expired",
            AuthError::Store(_) => "store_error",
        }
    }
}

/// An inbound frame could not be turned into a chat message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Handing a message to one connection failed. Only that connection is
/// affected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection writer has gone away")]
    Closed,
    #[error("connection outbound queue is full")]
    Saturated,
}

impl DeliveryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Closed => "closed",
            DeliveryError::Saturated => "saturated",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("identity is already registered")]
    Duplicate,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("broadcast hub is no longer draining")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load history: {0}")]
    History(#[from] PersistenceError),
    #[error("failed to deliver history: {0}")]
    HistoryDelivery(DeliveryError),
}

/// Errors surfaced by the HTTP routes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ApiErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg))
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(inner) => ApiError::Internal(inner.to_string()),
            _ => ApiError::Unauthorized,
        }
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Duplicate => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
