//! Lifecycle transitions for signing sessions.
//!
//! Every function here validates first and mutates second, on an in-memory
//! copy of the record. A rejected transition leaves the session untouched, and
//! the repository only writes the copy back when the transition succeeded.
//!
//! ```text
//! Pending ──all signers signed──▶ Completed
//! Pending ──void──▶ Voided                      (terminal)
//! Completed ──void──▶ Voided                    (only if policy allows)
//! Pending ──revise──▶ Pending                   (nobody signed yet)
//! Pending|Completed ──restart──▶ Pending        (full reset)
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::audit::{hash_document, AuditAction, AuditTrail};
use crate::error::{Result, SigningError};
use crate::model::{Field, Recipient, Session, SessionStatus};

/// Tolerance for fields that end exactly on the page edge
const EDGE_EPSILON: f64 = 1e-6;

/// Product policy for transitions that deployments decide differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Allow voiding a session after every signer has completed
    pub allow_void_completed: bool,
    /// Allow restarting a session after every signer has completed
    pub allow_restart_completed: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            allow_void_completed: false,
            allow_restart_completed: true,
        }
    }
}

/// Everything the owner supplies to open a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub document_name: String,
    pub document_alias: Option<String>,
    pub base_document: Vec<u8>,
    pub recipients: Vec<Recipient>,
    pub fields: Vec<Field>,
    pub owner_email: String,
    pub expires_at: DateTime<Utc>,
}

// ============================================================
// Validation
// ============================================================

pub fn validate_recipients(recipients: &[Recipient]) -> Result<()> {
    if recipients.is_empty() {
        return Err(SigningError::validation(
            "recipients",
            "at least one recipient is required",
        ));
    }

    let mut seen = HashSet::new();
    for (i, r) in recipients.iter().enumerate() {
        if r.id.trim().is_empty() {
            return Err(SigningError::validation(
                format!("recipients[{}].id", i),
                "must not be empty",
            ));
        }
        if !seen.insert(r.id.as_str()) {
            return Err(SigningError::validation(
                format!("recipients[{}].id", i),
                format!("duplicate recipient id {}", r.id),
            ));
        }
        let email = r.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(SigningError::validation(
                format!("recipients[{}].email", i),
                format!("{:?} is not an email address", r.email),
            ));
        }
    }

    if !recipients.iter().any(|r| r.is_signer()) {
        return Err(SigningError::validation(
            "recipients",
            "at least one recipient must have the signer role",
        ));
    }
    Ok(())
}

fn check_percent(value: f64, field: String, what: &str, positive: bool) -> Result<()> {
    if !value.is_finite() {
        return Err(SigningError::validation(
            field,
            format!("{} must be a finite number", what),
        ));
    }
    if value < 0.0 || value > 100.0 || (positive && value <= 0.0) {
        let range = if positive { "(0, 100]" } else { "[0, 100]" };
        return Err(SigningError::validation(
            field,
            format!("{} must be within {} percent, got {}", what, range, value),
        ));
    }
    Ok(())
}

/// Check field ids, ownership and normalized geometry
pub fn validate_fields(fields: &[Field], recipients: &[Recipient]) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, f) in fields.iter().enumerate() {
        let at = |attr: &str| format!("fields[{}].{}", i, attr);

        if f.id.trim().is_empty() {
            return Err(SigningError::validation(at("id"), "must not be empty"));
        }
        if !seen.insert(f.id.as_str()) {
            return Err(SigningError::validation(
                at("id"),
                format!("duplicate field id {}", f.id),
            ));
        }

        match recipients.iter().find(|r| r.id == f.recipient_id) {
            None => {
                return Err(SigningError::validation(
                    at("recipient_id"),
                    format!("field {} references unknown recipient {}", f.id, f.recipient_id),
                ))
            }
            Some(r) if !r.is_signer() => {
                return Err(SigningError::validation(
                    at("recipient_id"),
                    format!("field {} is assigned to {} who is not a signer", f.id, r.id),
                ))
            }
            Some(_) => {}
        }

        if f.page == 0 {
            return Err(SigningError::validation(at("page"), "pages are numbered from 1"));
        }

        check_percent(f.x_percent, at("x_percent"), "x_percent", false)?;
        check_percent(f.y_percent, at("y_percent"), "y_percent", false)?;
        check_percent(f.width_percent, at("width_percent"), "width_percent", true)?;
        check_percent(f.height_percent, at("height_percent"), "height_percent", true)?;

        if f.x_percent + f.width_percent > 100.0 + EDGE_EPSILON {
            return Err(SigningError::validation(
                at("width_percent"),
                format!("field {} extends beyond the right edge of the page", f.id),
            ));
        }
        if f.y_percent + f.height_percent > 100.0 + EDGE_EPSILON {
            return Err(SigningError::validation(
                at("height_percent"),
                format!("field {} extends beyond the bottom edge of the page", f.id),
            ));
        }
    }
    Ok(())
}

fn require_owner(session: &Session, actor_email: &str, action: &str) -> Result<()> {
    if !session.is_owner(actor_email) {
        return Err(SigningError::Forbidden(format!(
            "only the session owner may {} this session",
            action
        )));
    }
    Ok(())
}

// ============================================================
// Transitions
// ============================================================

/// Build a new Pending session with all recipients unsigned
pub fn create(new: NewSession, now: DateTime<Utc>) -> Result<Session> {
    if new.document_name.trim().is_empty() {
        return Err(SigningError::validation("document_name", "must not be empty"));
    }
    if new.base_document.is_empty() {
        return Err(SigningError::validation("base_document", "must not be empty"));
    }
    if !new.owner_email.contains('@') {
        return Err(SigningError::validation(
            "owner_email",
            format!("{:?} is not an email address", new.owner_email),
        ));
    }
    if new.expires_at <= now {
        return Err(SigningError::validation("expiry", "must be in the future"));
    }
    validate_recipients(&new.recipients)?;
    validate_fields(&new.fields, &new.recipients)?;

    let recipients = new
        .recipients
        .into_iter()
        .map(|mut r| {
            r.reset();
            r
        })
        .collect();

    let mut audit = AuditTrail::default();
    audit.append(AuditAction::Created, &new.owner_email, 0, now, None);

    Ok(Session {
        id: Uuid::new_v4().to_string(),
        status: SessionStatus::Pending,
        revision_count: 0,
        token_version: 0,
        document_name: new.document_name,
        document_alias: new.document_alias,
        document_hash: hash_document(&new.base_document),
        base_document: new.base_document,
        final_document: None,
        recipients,
        fields: new.fields,
        annotations: Vec::new(),
        owner_email: new.owner_email,
        voided_at: None,
        void_reason: None,
        created_at: now,
        updated_at: now,
        expires_at: new.expires_at,
        audit,
    })
}

/// Flip a Pending session to Completed once every signer has signed.
///
/// Returns `true` only for the call that performed the transition.
pub fn complete_if_ready(session: &mut Session, now: DateTime<Utc>) -> bool {
    if session.status != SessionStatus::Pending || !session.all_signers_signed() {
        return false;
    }
    session.status = SessionStatus::Completed;
    session.updated_at = now;
    let revision = session.revision_count;
    session.audit.append(
        AuditAction::Complete,
        &session.owner_email,
        revision,
        now,
        None,
    );
    info!("Session {} completed at revision {}", session.id, revision);
    true
}

pub fn void(
    session: &mut Session,
    actor_email: &str,
    reason: Option<String>,
    policy: LifecyclePolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    require_owner(session, actor_email, "void")?;
    match session.status {
        SessionStatus::Voided => {
            return Err(SigningError::InvalidTransition(
                "session has already been voided".into(),
            ))
        }
        SessionStatus::Completed if !policy.allow_void_completed => {
            return Err(SigningError::InvalidTransition(
                "cannot void a completed session".into(),
            ))
        }
        _ => {}
    }

    session.status = SessionStatus::Voided;
    session.voided_at = Some(now);
    session.void_reason = reason.clone();
    session.final_document = None;
    session.updated_at = now;
    session.audit.append(
        AuditAction::Void,
        actor_email,
        session.revision_count,
        now,
        reason,
    );
    Ok(())
}

/// Replace the field layout before anyone has signed
pub fn revise(
    session: &mut Session,
    actor_email: &str,
    fields: Vec<Field>,
    now: DateTime<Utc>,
) -> Result<()> {
    require_owner(session, actor_email, "revise")?;
    match session.status {
        SessionStatus::Voided => {
            return Err(SigningError::InvalidTransition(
                "cannot revise a voided session".into(),
            ))
        }
        SessionStatus::Completed => {
            return Err(SigningError::InvalidTransition(
                "cannot revise a completed session; restart it instead".into(),
            ))
        }
        SessionStatus::Pending => {}
    }
    if let Some(signed) = session.recipients.iter().find(|r| r.signed) {
        return Err(SigningError::InvalidTransition(format!(
            "cannot revise after recipient {} has signed; restart the session instead",
            signed.id
        )));
    }
    validate_fields(&fields, &session.recipients)?;

    session.fields = fields;
    session.revision_count += 1;
    session.token_version += 1;
    session.updated_at = now;
    session.audit.append(
        AuditAction::Revise,
        actor_email,
        session.revision_count,
        now,
        None,
    );
    Ok(())
}

/// Full reset: new layout, every recipient unsigned, annotations dropped
pub fn restart(
    session: &mut Session,
    actor_email: &str,
    fields: Vec<Field>,
    new_expiry: Option<DateTime<Utc>>,
    policy: LifecyclePolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    require_owner(session, actor_email, "restart")?;
    match session.status {
        SessionStatus::Voided => {
            return Err(SigningError::InvalidTransition(
                "cannot restart a voided session".into(),
            ))
        }
        SessionStatus::Completed if !policy.allow_restart_completed => {
            return Err(SigningError::InvalidTransition(
                "cannot restart a completed session".into(),
            ))
        }
        _ => {}
    }
    match new_expiry {
        Some(expiry) if expiry <= now => {
            return Err(SigningError::validation("expiry", "must be in the future"));
        }
        None if session.is_expired(now) => {
            return Err(SigningError::validation(
                "expiry",
                "session has expired; a new expiry is required to restart it",
            ));
        }
        _ => {}
    }
    validate_fields(&fields, &session.recipients)?;

    session.fields = fields;
    for recipient in session.recipients.iter_mut() {
        recipient.reset();
    }
    session.annotations.clear();
    session.final_document = None;
    session.status = SessionStatus::Pending;
    session.revision_count += 1;
    session.token_version += 1;
    if let Some(expiry) = new_expiry {
        session.expires_at = expiry;
    }
    session.updated_at = now;
    session.audit.append(
        AuditAction::Restart,
        actor_email,
        session.revision_count,
        now,
        None,
    );
    Ok(())
}

// ============================================================
// Invariants
// ============================================================

/// Verify the structural invariants of a session record
pub fn check_invariants(session: &Session) -> std::result::Result<(), String> {
    if session.final_document.is_some() && session.status != SessionStatus::Completed {
        return Err(format!(
            "final document cached while status is {}",
            session.status
        ));
    }

    if session.status != SessionStatus::Voided {
        let completed = session.status == SessionStatus::Completed;
        if completed != session.all_signers_signed() {
            return Err(format!(
                "status is {} but all_signers_signed is {}",
                session.status,
                session.all_signers_signed()
            ));
        }
    }

    let mut seen_fields = HashSet::new();
    for annotation in &session.annotations {
        let field = session
            .field(&annotation.field_id)
            .ok_or_else(|| format!("annotation references unknown field {}", annotation.field_id))?;
        let recipient = session.recipient(&annotation.recipient_id).ok_or_else(|| {
            format!(
                "annotation references unknown recipient {}",
                annotation.recipient_id
            )
        })?;
        if field.recipient_id != recipient.id {
            return Err(format!(
                "field {} belongs to {} but was annotated by {}",
                field.id, field.recipient_id, recipient.id
            ));
        }
        if !recipient.signed {
            return Err(format!(
                "recipient {} has annotations but is not marked signed",
                recipient.id
            ));
        }
        if !seen_fields.insert(annotation.field_id.as_str()) {
            return Err(format!(
                "field {} was annotated more than once",
                annotation.field_id
            ));
        }
    }

    session.audit.verify()
}
