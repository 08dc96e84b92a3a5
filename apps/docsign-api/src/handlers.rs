//! HTTP handlers for DocSign API

use axum::{
    extract::{FromRequest, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use docsign_core::{
    CreatedSession, Dashboard, NewSession, Recipient, SigningError, SigningLink, SubmitResult,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{account_from_headers, Account};
use crate::error::ApiError;
use crate::models::*;
use crate::state::AppState;

/// JSON body extractor whose rejections use the API error body
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// JSON response body for submit
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub all_signed: bool,
    pub remaining_signers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_ref: Option<docsign_core::DownloadRef>,
}

impl From<SubmitResult> for SubmitResponse {
    fn from(result: SubmitResult) -> Self {
        Self {
            all_signed: result.all_signed,
            remaining_signers: result.remaining_signers,
            download_ref: result.download_ref,
        }
    }
}

fn expiry_from_hours(hours: i64) -> Result<chrono::DateTime<Utc>, ApiError> {
    if !(1..=MAX_EXPIRY_HOURS).contains(&hours) {
        return Err(SigningError::validation(
            "expires_in_hours",
            format!("expires_in_hours must be between 1 and {}", MAX_EXPIRY_HOURS),
        )
        .into());
    }
    Duration::try_hours(hours)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            SigningError::validation("expires_in_hours", "expires_in_hours is out of range").into()
        })
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Create a new signing session
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    account: Account,
    ApiJson(req): ApiJson<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let base_document = BASE64.decode(req.pdf_base64.trim()).map_err(|e| {
        SigningError::validation("pdf_base64", format!("invalid base64: {}", e))
    })?;
    let expires_at = expiry_from_hours(req.expires_in_hours.unwrap_or(DEFAULT_EXPIRY_HOURS))?;

    let new = NewSession {
        document_name: req.document_name,
        document_alias: req.document_alias,
        base_document,
        recipients: req.recipients.into_iter().map(Recipient::from).collect(),
        fields: into_fields(req.fields)?,
        owner_email: account.email,
        expires_at,
    };

    let CreatedSession {
        session_id,
        signing_links,
    } = state.engine.create_session(new).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            signing_links,
        }),
    ))
}

/// Get session by ID
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    account: Account,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state.engine.get_session(&id, &account.email).await?;
    Ok(Json(session.into()))
}

/// Everything a signer needs to fill in their fields
pub async fn signing_view(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SigningQuery>,
) -> Result<Json<SigningViewResponse>, ApiError> {
    let mut view = state
        .engine
        .signing_view(&id, &query.recipient, &query.token)
        .await?;
    let pdf_base64 = BASE64.encode(std::mem::take(&mut view.base_document));
    Ok(Json(SigningViewResponse::new(view, pdf_base64)))
}

/// Submit a recipient's annotation batch
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let result = state
        .engine
        .submit(&id, &req.recipient_id, &req.token, req.annotations)
        .await?;
    Ok(Json(result.into()))
}

pub async fn decline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<DeclineRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .decline(&id, &req.recipient_id, &req.token, req.reason)
        .await?;
    Ok(Json(json!({})))
}

/// Get the document for a session, merged with every annotation so far.
///
/// Authorized by a download reference token or by a participant's bearer.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<(StatusCode, [(header::HeaderName, String); 2], Vec<u8>), ApiError> {
    let artifact = match query.token {
        Some(token) => state.engine.download_with_token(&id, &token).await?,
        None => {
            let account = account_from_headers(&state, &headers)?.ok_or_else(|| {
                ApiError::Unauthorized("download token or bearer token required".into())
            })?;
            state.engine.download_as(&id, &account.email).await?
        }
    };

    let file_name = artifact.file_name.replace(['"', '\\', '\r', '\n'], "_");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        artifact.bytes,
    ))
}

pub async fn void_session(
    State(state): State<Arc<AppState>>,
    account: Account,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<VoidRequest>,
) -> Result<Json<Value>, ApiError> {
    state.engine.void(&id, &account.email, req.reason).await?;
    Ok(Json(json!({})))
}

/// Replace the field layout before anyone signed
pub async fn revise(
    State(state): State<Arc<AppState>>,
    account: Account,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ReviseRequest>,
) -> Result<Json<Vec<SigningLink>>, ApiError> {
    let fields = into_fields(req.fields)?;
    let links = state.engine.revise(&id, &account.email, fields).await?;
    Ok(Json(links))
}

/// Reset signing state and reissue every link
pub async fn restart(
    State(state): State<Arc<AppState>>,
    account: Account,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<RestartRequest>,
) -> Result<Json<Vec<SigningLink>>, ApiError> {
    let fields = into_fields(req.fields)?;
    let new_expiry = req.expires_in_hours.map(expiry_from_hours).transpose()?;
    let links = state
        .engine
        .restart(&id, &account.email, fields, new_expiry)
        .await?;
    Ok(Json(links))
}

/// Sent and inbox views for the authenticated account
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    account: Account,
) -> Result<Json<Dashboard>, ApiError> {
    Ok(Json(state.engine.dashboard(&account.email).await?))
}

pub async fn associate(
    State(state): State<Arc<AppState>>,
    account: Account,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine.associate_session(&id, &account.email).await?;
    Ok(Json(json!({})))
}
