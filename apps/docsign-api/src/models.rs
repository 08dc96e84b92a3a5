//! Request and response bodies for DocSign API

use chrono::{DateTime, Utc};
use docsign_core::audit::AuditTrail;
use docsign_core::{
    AnnotationInput, Field, FieldType, Recipient, RecipientRole, Session, SessionStatus,
    SigningError, SigningLink, SigningView,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifetime when the request does not set one
pub const DEFAULT_EXPIRY_HOURS: i64 = 168;
/// Ten years
pub const MAX_EXPIRY_HOURS: i64 = 87_600;

// ============================================================
// Requests
// ============================================================

/// Recipient as supplied by the owner; signing state is server-side only
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInput {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: RecipientRole,
}

impl From<RecipientInput> for Recipient {
    fn from(input: RecipientInput) -> Self {
        Recipient::new(input.id, input.name, input.email, input.role)
    }
}

/// Field placement as supplied by the owner.
///
/// Positions stay loosely typed until [`FieldInput::into_field`] so a bad
/// value is reported against the field that carried it instead of as an
/// opaque body parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldInput {
    pub id: String,
    pub field_type: FieldType,
    pub recipient_id: String,
    #[serde(default)]
    pub page: Option<Value>,
    #[serde(default)]
    pub x_percent: Option<Value>,
    #[serde(default)]
    pub y_percent: Option<Value>,
    #[serde(default)]
    pub width_percent: Option<Value>,
    #[serde(default)]
    pub height_percent: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// Read a finite number out of a loosely typed JSON value
pub fn number_field(value: Option<&Value>, field: &str) -> Result<f64, SigningError> {
    let name = field.rsplit('.').next().unwrap_or(field);
    match value {
        None | Some(Value::Null) => Err(SigningError::validation(
            field,
            format!("{} is required", name),
        )),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                SigningError::validation(field, format!("{} must be a finite number", name))
            }),
        Some(_) => Err(SigningError::validation(
            field,
            format!("{} must be a finite number", name),
        )),
    }
}

/// Read a 1-based page number
pub fn page_field(value: Option<&Value>, field: &str) -> Result<u32, SigningError> {
    let page = number_field(value, field)?;
    if page.fract() != 0.0 || page < 1.0 || page > f64::from(u32::MAX) {
        return Err(SigningError::validation(
            field,
            "page must be a whole number of at least 1",
        ));
    }
    Ok(page as u32)
}

impl FieldInput {
    /// Convert the `index`-th field, naming it in any validation error
    pub fn into_field(self, index: usize) -> Result<Field, SigningError> {
        let path = |name: &str| format!("fields[{}].{}", index, name);
        Ok(Field {
            page: page_field(self.page.as_ref(), &path("page"))?,
            x_percent: number_field(self.x_percent.as_ref(), &path("x_percent"))?,
            y_percent: number_field(self.y_percent.as_ref(), &path("y_percent"))?,
            width_percent: number_field(self.width_percent.as_ref(), &path("width_percent"))?,
            height_percent: number_field(self.height_percent.as_ref(), &path("height_percent"))?,
            id: self.id,
            field_type: self.field_type,
            recipient_id: self.recipient_id,
            required: self.required,
        })
    }
}

pub fn into_fields(inputs: Vec<FieldInput>) -> Result<Vec<Field>, SigningError> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(i, f)| f.into_field(i))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub document_name: String,
    #[serde(default)]
    pub document_alias: Option<String>,
    pub pdf_base64: String,
    pub recipients: Vec<RecipientInput>,
    pub fields: Vec<FieldInput>,
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningQuery {
    pub recipient: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub recipient_id: String,
    pub token: String,
    pub annotations: Vec<AnnotationInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeclineRequest {
    pub recipient_id: String,
    pub token: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoidRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviseRequest {
    pub fields: Vec<FieldInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartRequest {
    pub fields: Vec<FieldInput>,
    /// New lifetime counted from now; the current expiry is kept when absent
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub token: Option<String>,
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub signing_links: Vec<SigningLink>,
}

/// Owner-facing view of a session; document bytes are left out
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub revision: u32,
    pub document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_alias: Option<String>,
    pub document_hash: String,
    pub owner_email: String,
    pub recipients: Vec<Recipient>,
    pub fields: Vec<Field>,
    pub signed_count: usize,
    pub signer_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub void_reason: Option<String>,
    pub audit: AuditTrail,
}

impl From<Session> for SessionSummary {
    fn from(session: Session) -> Self {
        Self {
            signed_count: session.signed_count(),
            signer_count: session.signer_count(),
            id: session.id,
            status: session.status,
            revision: session.revision_count,
            document_name: session.document_name,
            document_alias: session.document_alias,
            document_hash: session.document_hash,
            owner_email: session.owner_email,
            recipients: session.recipients,
            fields: session.fields,
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
            voided_at: session.voided_at,
            void_reason: session.void_reason,
            audit: session.audit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SigningViewResponse {
    pub session_id: String,
    pub document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_alias: Option<String>,
    pub status: SessionStatus,
    pub revision: u32,
    pub expires_at: DateTime<Utc>,
    pub recipient: Recipient,
    pub fields: Vec<Field>,
    pub pdf_base64: String,
}

impl SigningViewResponse {
    pub fn new(view: SigningView, pdf_base64: String) -> Self {
        Self {
            session_id: view.session_id,
            document_name: view.document_name,
            document_alias: view.document_alias,
            status: view.status,
            revision: view.revision,
            expires_at: view.expires_at,
            recipient: view.recipient,
            fields: view.fields,
            pdf_base64,
        }
    }
}
