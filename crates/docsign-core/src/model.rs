//! Data model for signing sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditTrail;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Completed,
    /// Terminal. Set by the owner, never by signing activity.
    Voided,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Voided => write!(f, "voided"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Signer,
    Reviewer,
    Cc,
}

/// A named participant on a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: RecipientRole,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub declined: bool,
    #[serde(default)]
    pub declined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decline_reason: Option<String>,
}

impl Recipient {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        role: RecipientRole,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            role,
            signed: false,
            signed_at: None,
            declined: false,
            declined_at: None,
            decline_reason: None,
        }
    }

    pub fn is_signer(&self) -> bool {
        self.role == RecipientRole::Signer
    }

    /// Clear signing and decline state for a fresh revision
    pub fn reset(&mut self) {
        self.signed = false;
        self.signed_at = None;
        self.declined = false;
        self.declined_at = None;
        self.decline_reason = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Signature,
    Initials,
    Text,
    Date,
    Checkbox,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Signature => "signature",
            FieldType::Initials => "initials",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Checkbox => "checkbox",
        };
        f.write_str(name)
    }
}

/// A placeable requirement on the document.
///
/// Positions are percentages of the page size with a top-left origin, so the
/// model does not depend on the resolution the sender placed fields at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub field_type: FieldType,
    pub recipient_id: String,
    /// 1-based page number
    pub page: u32,
    pub x_percent: f64,
    pub y_percent: f64,
    pub width_percent: f64,
    pub height_percent: f64,
    #[serde(default)]
    pub required: bool,
}

/// Payload a recipient supplies for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationData {
    /// PNG image as a `data:image/png;base64,...` URL
    DrawnSignature { image: String },
    TypedSignature { text: String, font: String },
    Text { value: String },
    Date { value: String },
    Checkbox { checked: bool },
}

impl AnnotationData {
    /// Whether this payload can fulfil a field of the given type
    pub fn fits(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (
                AnnotationData::DrawnSignature { .. } | AnnotationData::TypedSignature { .. },
                FieldType::Signature | FieldType::Initials
            ) | (AnnotationData::Text { .. }, FieldType::Text)
                | (AnnotationData::Date { .. }, FieldType::Date)
                | (AnnotationData::Checkbox { .. }, FieldType::Checkbox)
        )
    }

    /// Approximate stored size, used to bound batches
    pub fn payload_len(&self) -> usize {
        match self {
            AnnotationData::DrawnSignature { image } => image.len(),
            AnnotationData::TypedSignature { text, font } => text.len() + font.len(),
            AnnotationData::Text { value } | AnnotationData::Date { value } => value.len(),
            AnnotationData::Checkbox { .. } => 1,
        }
    }
}

/// A recipient's fulfilment of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub field_id: String,
    pub recipient_id: String,
    pub data: AnnotationData,
}

/// Merged artifact cached on a completed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    /// Revision the artifact was merged for
    pub revision: u32,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// One signing transaction and its full state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub revision_count: u32,
    pub token_version: u32,
    pub document_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_alias: Option<String>,
    #[serde(with = "base64_bytes")]
    pub base_document: Vec<u8>,
    pub document_hash: String,
    #[serde(default)]
    pub final_document: Option<CachedDocument>,
    pub recipients: Vec<Recipient>,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub owner_email: String,
    #[serde(default)]
    pub voided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub void_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub audit: AuditTrail,
}

impl Session {
    pub fn recipient(&self, recipient_id: &str) -> Option<&Recipient> {
        self.recipients.iter().find(|r| r.id == recipient_id)
    }

    pub fn recipient_mut(&mut self, recipient_id: &str) -> Option<&mut Recipient> {
        self.recipients.iter_mut().find(|r| r.id == recipient_id)
    }

    pub fn field(&self, field_id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == field_id)
    }

    pub fn signers(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(|r| r.is_signer())
    }

    pub fn signer_count(&self) -> usize {
        self.signers().count()
    }

    pub fn signed_count(&self) -> usize {
        self.signers().filter(|r| r.signed).count()
    }

    pub fn remaining_signers(&self) -> usize {
        self.signers().filter(|r| !r.signed).count()
    }

    pub fn all_signers_signed(&self) -> bool {
        self.signers().all(|r| r.signed)
    }

    pub fn any_signed(&self) -> bool {
        self.recipients.iter().any(|r| r.signed)
    }

    pub fn any_declined(&self) -> bool {
        self.recipients.iter().any(|r| r.declined)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn is_owner(&self, email: &str) -> bool {
        normalize_email(&self.owner_email) == normalize_email(email)
    }

    /// Recipients whose email matches the account, ignoring case and padding
    pub fn recipients_for_email<'a>(
        &'a self,
        email: &'a str,
    ) -> impl Iterator<Item = &'a Recipient> + 'a {
        let wanted = normalize_email(email);
        self.recipients
            .iter()
            .filter(move |r| normalize_email(&r.email) == wanted)
    }

    /// Display name for dashboards: alias when set, filename otherwise
    pub fn display_name(&self) -> &str {
        self.document_alias.as_deref().unwrap_or(&self.document_name)
    }
}

/// Canonical form used for every email comparison and index key
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Serde adapter storing byte blobs as standard base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
