//! Error types for DocSign API

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use docsign_core::SigningError;
use serde_json::json;
use thiserror::Error;

/// Seconds a client should wait before retrying a 503
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Signing(e) => match e {
                SigningError::NotFound(_) => StatusCode::NOT_FOUND,
                SigningError::Forbidden(_) => StatusCode::FORBIDDEN,
                SigningError::AlreadySigned { .. } => StatusCode::BAD_REQUEST,
                SigningError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
                SigningError::TokenExpired(_) => StatusCode::GONE,
                SigningError::Validation { .. } => StatusCode::BAD_REQUEST,
                SigningError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Signing(e) => e.kind(),
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Signing(SigningError::StoreUnavailable(detail)) => {
                tracing::error!("Store unavailable: {}", detail);
                "Storage temporarily unavailable, retry shortly".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "kind": self.kind(),
            "status": status.as_u16(),
        }));

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response();
        }
        (status, body).into_response()
    }
}
