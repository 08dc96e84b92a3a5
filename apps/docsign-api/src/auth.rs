//! Account authentication via bearer tokens

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use docsign_core::tokens::extract_bearer_token;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated owner or recipient account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub email: String,
}

/// Resolve the bearer account, if the request carries one.
///
/// A present but invalid token is an error rather than anonymous access.
pub fn account_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Account>, ApiError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(token) = extract_bearer_token(header) else {
        return Ok(None);
    };
    let claims = state
        .engine
        .tokens()
        .verify_account_token(&token)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
    Ok(Some(Account {
        email: claims.email,
    }))
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Account {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        account_from_headers(state, &parts.headers)?
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))
    }
}
