//! Recipient responses: annotation batches and declines.
//!
//! A signer submits exactly one batch per revision. The batch is validated as a
//! whole before anything is appended, so a bad field leaves the session exactly
//! as it was.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditAction;
use crate::error::{Result, SigningError};
use crate::merger::decode_png_data_url;
use crate::model::{Annotation, AnnotationData, FieldType, Session, SessionStatus};
use crate::state_machine::complete_if_ready;

/// Upper bound on the payload of one batch
pub const MAX_BATCH_BYTES: usize = 2 * 1024 * 1024;

/// Longest accepted decline reason
pub const MAX_DECLINE_REASON_CHARS: usize = 1000;

/// One item of a submitted batch; the recipient is implied by the credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationInput {
    pub field_id: String,
    pub data: AnnotationData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub all_signed: bool,
    pub remaining_signers: usize,
    /// True only for the submission that moved the session to Completed
    pub completed_now: bool,
}

/// Checks shared by submit and decline
fn check_can_respond(session: &Session, recipient_id: &str, now: DateTime<Utc>) -> Result<()> {
    let recipient = session
        .recipient(recipient_id)
        .ok_or_else(|| SigningError::NotFound(format!("recipient {}", recipient_id)))?;

    if !recipient.is_signer() {
        return Err(SigningError::Forbidden(format!(
            "recipient {} is not a signer on this session",
            recipient_id
        )));
    }
    if recipient.signed {
        return Err(SigningError::AlreadySigned {
            recipient_id: recipient_id.to_string(),
        });
    }
    match session.status {
        SessionStatus::Voided => {
            return Err(SigningError::InvalidTransition(
                "session has been voided by the sender".into(),
            ))
        }
        SessionStatus::Completed => {
            return Err(SigningError::InvalidTransition(
                "session is already completed".into(),
            ))
        }
        SessionStatus::Pending => {}
    }
    if session.is_expired(now) {
        return Err(SigningError::InvalidTransition(format!(
            "session expired at {}",
            session.expires_at.to_rfc3339()
        )));
    }
    if recipient.declined {
        return Err(SigningError::InvalidTransition(format!(
            "recipient {} has declined to sign",
            recipient_id
        )));
    }
    Ok(())
}

fn validate_payload(
    index: usize,
    field_type: FieldType,
    required: bool,
    data: &AnnotationData,
) -> Result<()> {
    let at = |attr: &str| format!("annotations[{}].{}", index, attr);

    match data {
        AnnotationData::DrawnSignature { image } => {
            decode_png_data_url(image)
                .map_err(|e| SigningError::validation(at("image"), e.to_string()))?;
        }
        AnnotationData::TypedSignature { text, font } => {
            if text.trim().is_empty() {
                return Err(SigningError::validation(
                    at("text"),
                    format!("{} text must not be empty", field_type),
                ));
            }
            if font.trim().is_empty() {
                return Err(SigningError::validation(at("font"), "font must not be empty"));
            }
        }
        AnnotationData::Text { value } | AnnotationData::Date { value } => {
            if required && value.trim().is_empty() {
                return Err(SigningError::validation(
                    at("value"),
                    format!("required {} field must not be empty", field_type),
                ));
            }
        }
        AnnotationData::Checkbox { .. } => {}
    }
    Ok(())
}

fn validate_batch(session: &Session, recipient_id: &str, batch: &[AnnotationInput]) -> Result<()> {
    let total: usize = batch.iter().map(|a| a.data.payload_len()).sum();
    if total > MAX_BATCH_BYTES {
        return Err(SigningError::validation(
            "annotations",
            format!("batch is {} bytes, limit is {}", total, MAX_BATCH_BYTES),
        ));
    }

    let mut seen = HashSet::new();
    for (i, input) in batch.iter().enumerate() {
        let field = session.field(&input.field_id).ok_or_else(|| {
            SigningError::validation(
                format!("annotations[{}].field_id", i),
                format!("unknown field {}", input.field_id),
            )
        })?;

        if field.recipient_id != recipient_id {
            return Err(SigningError::Forbidden(format!(
                "field {} is assigned to another recipient",
                field.id
            )));
        }
        if !seen.insert(field.id.as_str()) {
            return Err(SigningError::validation(
                format!("annotations[{}].field_id", i),
                format!("field {} appears more than once", field.id),
            ));
        }
        if !input.data.fits(field.field_type) {
            return Err(SigningError::validation(
                format!("annotations[{}].data", i),
                format!("payload does not fit a {} field", field.field_type),
            ));
        }
        validate_payload(i, field.field_type, field.required, &input.data)?;
    }

    if let Some(missing) = session
        .fields
        .iter()
        .filter(|f| f.recipient_id == recipient_id && f.required)
        .find(|f| !seen.contains(f.id.as_str()))
    {
        return Err(SigningError::validation(
            format!("fields.{}", missing.id),
            format!("required {} field was not filled in", missing.field_type),
        ));
    }
    Ok(())
}

/// Append a recipient's batch and mark them signed
pub fn apply_submission(
    session: &mut Session,
    recipient_id: &str,
    batch: &[AnnotationInput],
    now: DateTime<Utc>,
) -> Result<SubmitOutcome> {
    check_can_respond(session, recipient_id, now)?;
    validate_batch(session, recipient_id, batch)?;

    session
        .annotations
        .extend(batch.iter().map(|input| Annotation {
            field_id: input.field_id.clone(),
            recipient_id: recipient_id.to_string(),
            data: input.data.clone(),
        }));

    let email = match session.recipient_mut(recipient_id) {
        Some(recipient) => {
            recipient.signed = true;
            recipient.signed_at = Some(now);
            recipient.email.clone()
        }
        None => return Err(SigningError::NotFound(format!("recipient {}", recipient_id))),
    };
    session.updated_at = now;
    session.audit.append(
        AuditAction::Sign {
            recipient_id: recipient_id.to_string(),
        },
        &email,
        session.revision_count,
        now,
        Some(format!("{} annotation(s)", batch.len())),
    );

    let completed_now = complete_if_ready(session, now);
    let remaining_signers = session.remaining_signers();
    Ok(SubmitOutcome {
        all_signed: remaining_signers == 0,
        remaining_signers,
        completed_now,
    })
}

/// Record that a signer refuses to sign; the session stays Pending
pub fn apply_decline(
    session: &mut Session,
    recipient_id: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    check_can_respond(session, recipient_id, now)?;

    let reason = reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if let Some(ref r) = reason {
        if r.chars().count() > MAX_DECLINE_REASON_CHARS {
            return Err(SigningError::validation(
                "reason",
                format!("must be at most {} characters", MAX_DECLINE_REASON_CHARS),
            ));
        }
    }

    let email = match session.recipient_mut(recipient_id) {
        Some(recipient) => {
            recipient.declined = true;
            recipient.declined_at = Some(now);
            recipient.decline_reason = reason.clone();
            recipient.email.clone()
        }
        None => return Err(SigningError::NotFound(format!("recipient {}", recipient_id))),
    };
    session.updated_at = now;
    session.audit.append(
        AuditAction::Decline {
            recipient_id: recipient_id.to_string(),
        },
        &email,
        session.revision_count,
        now,
        reason,
    );
    Ok(())
}
