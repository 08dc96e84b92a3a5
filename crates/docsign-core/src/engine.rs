//! The signing engine: every externally visible operation in one place.
//!
//! Each mutation is a single [`SessionRepository::update`] cycle. Guards run
//! inside the closure against the freshly read record, so a rejected request
//! writes nothing and a lost race is simply retried. Index and notification
//! side effects happen after the write and never fail the request.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::audit::AuditAction;
use crate::collector::{apply_decline, apply_submission, AnnotationInput};
use crate::dashboard::{Dashboard, DashboardIndexer};
use crate::download::{Artifact, DownloadService, DEFAULT_LINK_LIFETIME_DAYS};
use crate::error::{Result, SigningError, StoreError};
use crate::merger;
use crate::model::{normalize_email, Field, Recipient, Session, SessionStatus};
use crate::notify::{vars, Notification, Notifier};
use crate::repository::{SessionRepository, DEFAULT_MAX_ATTEMPTS};
use crate::state_machine::{self, LifecyclePolicy, NewSession};
use crate::store::BlobStore;
use crate::tokens::{check_token_version, DownloadRef, SigningClaims, SigningLink, TokenIssuer};

/// How often a freshly generated session id may collide before giving up
const CREATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: LifecyclePolicy,
    pub download_link_lifetime: Duration,
    pub max_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: LifecyclePolicy::default(),
            download_link_lifetime: Duration::days(DEFAULT_LINK_LIFETIME_DAYS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: String,
    pub signing_links: Vec<SigningLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub all_signed: bool,
    pub remaining_signers: usize,
    /// Only present for the submission that completed the session
    pub download_ref: Option<DownloadRef>,
}

/// What a signer needs to render their part of the document
#[derive(Debug, Clone, PartialEq)]
pub struct SigningView {
    pub session_id: String,
    pub document_name: String,
    pub document_alias: Option<String>,
    pub status: SessionStatus,
    pub revision: u32,
    pub expires_at: DateTime<Utc>,
    pub recipient: Recipient,
    /// Only the fields assigned to this recipient
    pub fields: Vec<Field>,
    pub base_document: Vec<u8>,
}

#[derive(Clone)]
pub struct SigningEngine {
    repo: SessionRepository,
    tokens: TokenIssuer,
    downloads: DownloadService,
    indexer: DashboardIndexer,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

/// Reject fields placed on pages the base document does not have
fn check_pages(base_document: &[u8], fields: &[Field]) -> Result<()> {
    let pages = merger::page_count(base_document).map_err(|e| {
        SigningError::validation("base_document", format!("not a readable PDF: {}", e))
    })?;
    if pages == 0 {
        return Err(SigningError::validation("base_document", "document has no pages"));
    }
    if let Some((i, f)) = fields.iter().enumerate().find(|(_, f)| f.page > pages) {
        return Err(SigningError::validation(
            format!("fields[{}].page", i),
            format!("field {} is on page {} but the document has {}", f.id, f.page, pages),
        ));
    }
    Ok(())
}

impl SigningEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        tokens: TokenIssuer,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let repo = SessionRepository::new(store).with_max_attempts(config.max_attempts);
        let downloads =
            DownloadService::new(repo.clone(), tokens.clone(), config.download_link_lifetime);
        let indexer = DashboardIndexer::new(repo.clone());
        Self {
            repo,
            tokens,
            downloads,
            indexer,
            notifier,
            config,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn indexer(&self) -> &DashboardIndexer {
        &self.indexer
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.config.policy
    }

    // ============================================================
    // Owner operations
    // ============================================================

    pub async fn create_session(&self, new: NewSession) -> Result<CreatedSession> {
        check_pages(&new.base_document, &new.fields)?;
        let mut session = state_machine::create(new, Utc::now())?;

        let mut attempt = 1;
        loop {
            match self.repo.create(&session).await {
                Ok(_) => break,
                Err(StoreError::Conflict { .. }) if attempt < CREATE_ATTEMPTS => {
                    warn!("Session id {} already taken, generating another", session.id);
                    session.id = uuid::Uuid::new_v4().to_string();
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            "Created session {} ({} recipients, {} fields)",
            session.id,
            session.recipients.len(),
            session.fields.len()
        );

        self.indexer.refresh(&session).await;
        let signing_links = self.tokens.signing_links(&session)?;
        self.notify_signers(&session, &signing_links, Notification::SigningRequest)
            .await;

        Ok(CreatedSession {
            session_id: session.id,
            signing_links,
        })
    }

    /// Full record, visible to the owner and to the session's recipients
    pub async fn get_session(&self, session_id: &str, actor_email: &str) -> Result<Session> {
        let session = self.repo.get(session_id).await?.value;
        let is_recipient = session.recipients_for_email(actor_email).next().is_some();
        if !session.is_owner(actor_email) && !is_recipient {
            return Err(SigningError::Forbidden(
                "account is not a participant in this session".into(),
            ));
        }
        Ok(session)
    }

    pub async fn void(
        &self,
        session_id: &str,
        actor_email: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let policy = self.config.policy;
        let updated = self
            .repo
            .update(session_id, |s| {
                state_machine::void(s, actor_email, reason.clone(), policy, now)
            })
            .await?;

        info!("Session {} voided by owner", session_id);
        self.indexer.refresh(&updated.session).await;

        let session = &updated.session;
        let reason = session.void_reason.clone().unwrap_or_default();
        for recipient in &session.recipients {
            self.notify(
                &recipient.email,
                Notification::SessionVoided,
                vars([
                    ("session_id", session.id.as_str()),
                    ("document_name", session.display_name()),
                    ("reason", reason.as_str()),
                ]),
            )
            .await;
        }
        Ok(())
    }

    /// Replace the field layout before anyone signed; returns fresh links
    pub async fn revise(
        &self,
        session_id: &str,
        actor_email: &str,
        fields: Vec<Field>,
    ) -> Result<Vec<SigningLink>> {
        let now = Utc::now();
        let updated = self
            .repo
            .update(session_id, |s| {
                state_machine::revise(s, actor_email, fields.clone(), now)?;
                check_pages(&s.base_document, &s.fields)
            })
            .await?;

        info!(
            "Session {} revised to revision {}",
            session_id, updated.session.revision_count
        );
        self.reissue(&updated.session).await
    }

    /// Reset all signing state; returns fresh links
    pub async fn restart(
        &self,
        session_id: &str,
        actor_email: &str,
        fields: Vec<Field>,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<Vec<SigningLink>> {
        let now = Utc::now();
        let policy = self.config.policy;
        let updated = self
            .repo
            .update(session_id, |s| {
                state_machine::restart(s, actor_email, fields.clone(), new_expiry, policy, now)?;
                check_pages(&s.base_document, &s.fields)
            })
            .await?;

        info!(
            "Session {} restarted at revision {}",
            session_id, updated.session.revision_count
        );
        self.reissue(&updated.session).await
    }

    /// Owner-requested download reference for the current revision
    pub async fn download_ref(&self, session_id: &str, actor_email: &str) -> Result<DownloadRef> {
        let session = self.repo.get(session_id).await?.value;
        if !session.is_owner(actor_email) {
            return Err(SigningError::Forbidden(
                "only the session owner may request a download link".into(),
            ));
        }
        self.downloads.download_ref(&session)
    }

    // ============================================================
    // Signer operations
    // ============================================================

    fn verify_signer(
        &self,
        session_id: &str,
        recipient_id: &str,
        token: &str,
    ) -> Result<SigningClaims> {
        let claims = self.tokens.verify_signing_token(token, session_id)?;
        if claims.rid != recipient_id {
            return Err(SigningError::Forbidden(
                "signing link belongs to a different recipient".into(),
            ));
        }
        Ok(claims)
    }

    pub async fn signing_view(
        &self,
        session_id: &str,
        recipient_id: &str,
        token: &str,
    ) -> Result<SigningView> {
        let claims = self.verify_signer(session_id, recipient_id, token)?;
        let session = self.repo.get(session_id).await?.value;
        check_token_version(&claims, &session)?;

        let recipient = session
            .recipient(recipient_id)
            .cloned()
            .ok_or_else(|| SigningError::NotFound(format!("recipient {}", recipient_id)))?;
        let fields = session
            .fields
            .iter()
            .filter(|f| f.recipient_id == recipient_id)
            .cloned()
            .collect();

        Ok(SigningView {
            session_id: session.id,
            document_name: session.document_name,
            document_alias: session.document_alias,
            status: session.status,
            revision: session.revision_count,
            expires_at: session.expires_at,
            recipient,
            fields,
            base_document: session.base_document,
        })
    }

    pub async fn submit(
        &self,
        session_id: &str,
        recipient_id: &str,
        token: &str,
        batch: Vec<AnnotationInput>,
    ) -> Result<SubmitResult> {
        let claims = self.verify_signer(session_id, recipient_id, token)?;
        let now = Utc::now();
        let updated = self
            .repo
            .update(session_id, |s| {
                check_token_version(&claims, s)?;
                apply_submission(s, recipient_id, &batch, now)
            })
            .await?;
        let outcome = updated.output;
        let session = &updated.session;

        info!(
            "Recipient {} signed session {} ({} signer(s) remaining)",
            recipient_id, session_id, outcome.remaining_signers
        );
        self.indexer.refresh(session).await;

        let download_ref = if outcome.completed_now {
            self.notify_completed(session).await;
            Some(self.downloads.download_ref(session)?)
        } else {
            None
        };

        Ok(SubmitResult {
            all_signed: outcome.all_signed,
            remaining_signers: outcome.remaining_signers,
            download_ref,
        })
    }

    pub async fn decline(
        &self,
        session_id: &str,
        recipient_id: &str,
        token: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let claims = self.verify_signer(session_id, recipient_id, token)?;
        let now = Utc::now();
        let updated = self
            .repo
            .update(session_id, |s| {
                check_token_version(&claims, s)?;
                apply_decline(s, recipient_id, reason.clone(), now)
            })
            .await?;
        let session = &updated.session;

        info!("Recipient {} declined session {}", recipient_id, session_id);
        self.indexer.refresh(session).await;

        let (name, reason) = session
            .recipient(recipient_id)
            .map(|r| (r.name.clone(), r.decline_reason.clone().unwrap_or_default()))
            .unwrap_or_default();
        self.notify(
            &session.owner_email,
            Notification::RecipientDeclined,
            vars([
                ("session_id", session.id.as_str()),
                ("document_name", session.display_name()),
                ("recipient_name", name.as_str()),
                ("reason", reason.as_str()),
            ]),
        )
        .await;
        Ok(())
    }

    // ============================================================
    // Downloads
    // ============================================================

    /// Download authorized by a reference token
    pub async fn download_with_token(&self, session_id: &str, token: &str) -> Result<Artifact> {
        self.downloads.download_with_token(session_id, token).await
    }

    /// Download by an authenticated participant of the session
    pub async fn download_as(&self, session_id: &str, actor_email: &str) -> Result<Artifact> {
        self.get_session(session_id, actor_email).await?;
        self.downloads.download(session_id).await
    }

    /// Unauthenticated download for trusted callers
    pub async fn download(&self, session_id: &str) -> Result<Artifact> {
        self.downloads.download(session_id).await
    }

    // ============================================================
    // Dashboards
    // ============================================================

    pub async fn dashboard(&self, account_email: &str) -> Result<Dashboard> {
        self.indexer.list(account_email, Utc::now()).await
    }

    /// Claim inbox visibility for a session the account was named on
    pub async fn associate_session(&self, session_id: &str, account_email: &str) -> Result<()> {
        let now = Utc::now();
        let updated = self
            .repo
            .update(session_id, |s| {
                if s.recipients_for_email(account_email).next().is_none() {
                    return Err(SigningError::Forbidden(
                        "account email does not match any recipient on this session".into(),
                    ));
                }
                let email = normalize_email(account_email);
                let already = s
                    .audit
                    .events
                    .iter()
                    .filter(|e| e.action == AuditAction::Associate)
                    .any(|e| normalize_email(&e.actor_email) == email);
                if !already {
                    let revision = s.revision_count;
                    s.audit.append(AuditAction::Associate, &email, revision, now, None);
                }
                Ok(())
            })
            .await?;

        if let Err(e) = self
            .indexer
            .project_inbox(&updated.session, account_email)
            .await
        {
            warn!(
                "Inbox projection failed for session {}, queued for reconcile: {}",
                session_id, e
            );
            self.indexer.refresh(&updated.session).await;
        }
        Ok(())
    }

    /// Rebuild index projections that failed earlier
    pub async fn reconcile_indexes(&self) -> usize {
        self.indexer.reconcile_pending().await
    }

    // ============================================================
    // Side effects
    // ============================================================

    async fn reissue(&self, session: &Session) -> Result<Vec<SigningLink>> {
        self.indexer.refresh(session).await;
        let links = self.tokens.signing_links(session)?;
        self.notify_signers(session, &links, Notification::DocumentUpdated)
            .await;
        Ok(links)
    }

    async fn notify_signers(
        &self,
        session: &Session,
        links: &[SigningLink],
        template: Notification,
    ) {
        for link in links {
            let Some(recipient) = session.recipient(&link.recipient_id) else {
                continue;
            };
            if !recipient.is_signer() {
                continue;
            }
            self.notify(
                &recipient.email,
                template,
                vars([
                    ("session_id", session.id.as_str()),
                    ("document_name", session.display_name()),
                    ("recipient_name", recipient.name.as_str()),
                    ("signing_url", link.signing_url.as_str()),
                ]),
            )
            .await;
        }
    }

    async fn notify_completed(&self, session: &Session) {
        let mut to: Vec<&str> = vec![session.owner_email.as_str()];
        to.extend(session.recipients.iter().map(|r| r.email.as_str()));
        for email in to {
            self.notify(
                email,
                Notification::SessionCompleted,
                vars([
                    ("session_id", session.id.as_str()),
                    ("document_name", session.display_name()),
                ]),
            )
            .await;
        }
    }

    async fn notify(&self, to: &str, template: Notification, vars: crate::notify::Vars) {
        if let Err(e) = self.notifier.send(to, template, &vars).await {
            warn!("Failed to send {} notification to {}: {}", template.as_str(), to, e);
        }
    }
}
