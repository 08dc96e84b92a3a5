//! Error taxonomy for the signing engine

use thiserror::Error;

/// Errors surfaced by every engine operation.
///
/// Only [`SigningError::StoreUnavailable`] is worth retrying. Everything else
/// is terminal for the request and carries enough detail (which field, which
/// recipient) for the caller to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Recipient {recipient_id} has already signed this revision")]
    AlreadySigned { recipient_id: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Link is no longer valid: {0}")]
    TokenExpired(String),

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SigningError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SigningError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same request with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, SigningError::StoreUnavailable(_))
    }

    /// Stable machine-readable name, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            SigningError::NotFound(_) => "not_found",
            SigningError::Forbidden(_) => "forbidden",
            SigningError::AlreadySigned { .. } => "already_signed",
            SigningError::InvalidTransition(_) => "invalid_transition",
            SigningError::TokenExpired(_) => "token_expired",
            SigningError::Validation { .. } => "validation_error",
            SigningError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Errors from the byte-blob store underneath the repository
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Conditional write lost against a concurrent writer
    #[error("Version conflict on {key}")]
    Conflict { key: String },

    #[error("Record {key} is {size} bytes, limit is {limit}")]
    TooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("Record {key} could not be decoded: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SigningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TooLarge { size, limit, .. } => SigningError::validation(
                "session",
                format!(
                    "record would be {} bytes, exceeding the {} byte limit",
                    size, limit
                ),
            ),
            other => SigningError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Errors from the pure document merger
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Failed to parse PDF: {0}")]
    ParseError(String),

    #[error("Annotation for field {field_id} could not be rendered: {reason}")]
    InvalidAnnotation { field_id: String, reason: String },

    #[error("Page {page} does not exist in the document")]
    MissingPage { page: u32 },

    #[error("PDF operation failed: {0}")]
    OperationError(String),
}

impl From<MergeError> for SigningError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::InvalidAnnotation { field_id, reason } => {
                SigningError::validation(field_id, reason)
            }
            MergeError::MissingPage { page } => {
                SigningError::validation("page", format!("page {} does not exist", page))
            }
            other => SigningError::StoreUnavailable(format!("stored document unusable: {}", other)),
        }
    }
}

pub type Result<T, E = SigningError> = std::result::Result<T, E>;
