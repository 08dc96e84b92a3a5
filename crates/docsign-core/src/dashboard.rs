//! "Sent" and "inbox" views per account.
//!
//! Both are derived from session records and stored as one index record per
//! account and view, keyed by the SHA-256 of the normalized email. The index
//! is never the source of truth: a failed index write is logged, queued and
//! rebuilt from the session later.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{SigningError, StoreError};
use crate::model::{normalize_email, Recipient, RecipientRole, Session, SessionStatus};
use crate::repository::{SessionRepository, DEFAULT_MAX_ATTEMPTS};
use crate::store::Expect;

/// Hex SHA-256 of the normalized email
pub fn email_hash(email: &str) -> String {
    hex::encode(Sha256::digest(normalize_email(email).as_bytes()))
}

pub fn sent_key(email: &str) -> String {
    format!("sent:{}", email_hash(email))
}

pub fn inbox_key(email: &str) -> String {
    format!("inbox:{}", email_hash(email))
}

/// The account's own part in a session, for inbox entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRole {
    pub recipient_id: String,
    pub role: RecipientRole,
    pub signed: bool,
    pub declined: bool,
}

/// Snapshot of one session as shown on a dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardIndexEntry {
    pub session_id: String,
    pub document_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_alias: Option<String>,
    pub status: SessionStatus,
    pub signed_count: usize,
    pub signer_count: usize,
    /// Some signer declined this revision
    pub declined: bool,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Audit length of the projected record; older projections never overwrite newer ones
    pub sequence: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<InboxRole>,
}

impl DashboardIndexEntry {
    pub fn sent(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            document_name: session.document_name.clone(),
            document_alias: session.document_alias.clone(),
            status: session.status,
            signed_count: session.signed_count(),
            signer_count: session.signer_count(),
            declined: session.any_declined(),
            expires_at: session.expires_at,
            updated_at: session.updated_at,
            sequence: session.audit.len(),
            recipient: None,
        }
    }

    pub fn inbox(session: &Session, recipient: &Recipient) -> Self {
        Self {
            recipient: Some(InboxRole {
                recipient_id: recipient.id.clone(),
                role: recipient.role,
                signed: recipient.signed,
                declined: recipient.declined,
            }),
            ..Self::sent(session)
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Pending && self.expires_at < now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct IndexRecord {
    entries: BTreeMap<String, DashboardIndexEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentView {
    pub in_progress: Vec<DashboardIndexEntry>,
    pub completed: Vec<DashboardIndexEntry>,
    pub declined: Vec<DashboardIndexEntry>,
    pub expired: Vec<DashboardIndexEntry>,
    pub voided: Vec<DashboardIndexEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxView {
    pub to_sign: Vec<DashboardIndexEntry>,
    pub completed: Vec<DashboardIndexEntry>,
    pub declined: Vec<DashboardIndexEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub sent: SentView,
    pub inbox: InboxView,
}

fn newest_first(mut entries: Vec<DashboardIndexEntry>) -> Vec<DashboardIndexEntry> {
    entries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    entries
}

pub fn partition_sent(entries: Vec<DashboardIndexEntry>, now: DateTime<Utc>) -> SentView {
    let mut view = SentView::default();
    for entry in newest_first(entries) {
        match entry.status {
            SessionStatus::Voided => view.voided.push(entry),
            SessionStatus::Completed => view.completed.push(entry),
            SessionStatus::Pending if entry.declined => view.declined.push(entry),
            SessionStatus::Pending if entry.is_expired(now) => view.expired.push(entry),
            SessionStatus::Pending => view.in_progress.push(entry),
        }
    }
    view
}

/// Voided sessions never appear in any inbox partition
pub fn partition_inbox(entries: Vec<DashboardIndexEntry>, now: DateTime<Utc>) -> InboxView {
    let mut view = InboxView::default();
    for entry in newest_first(entries) {
        let (signer, signed) = match entry.recipient {
            Some(ref r) => (r.role == RecipientRole::Signer, r.signed),
            None => continue,
        };
        match entry.status {
            SessionStatus::Voided => {}
            SessionStatus::Completed => view.completed.push(entry),
            SessionStatus::Pending if entry.declined => view.declined.push(entry),
            SessionStatus::Pending if signed => view.completed.push(entry),
            SessionStatus::Pending if signer && !entry.is_expired(now) => {
                view.to_sign.push(entry)
            }
            SessionStatus::Pending => {}
        }
    }
    view
}

#[derive(Clone)]
pub struct DashboardIndexer {
    repo: SessionRepository,
    pending: Arc<Mutex<HashSet<String>>>,
    max_attempts: usize,
}

impl DashboardIndexer {
    pub fn new(repo: SessionRepository) -> Self {
        Self {
            repo,
            pending: Arc::new(Mutex::new(HashSet::new())),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Project a session into its owner's sent view and every recipient's inbox
    pub async fn try_refresh(&self, session: &Session) -> Result<(), StoreError> {
        self.upsert(&sent_key(&session.owner_email), DashboardIndexEntry::sent(session))
            .await?;

        let mut seen = HashSet::new();
        for recipient in &session.recipients {
            let email = normalize_email(&recipient.email);
            if !seen.insert(email.clone()) {
                continue;
            }
            self.project_inbox(session, &email).await?;
        }
        Ok(())
    }

    /// Like [`Self::try_refresh`], but a failure only queues the session
    pub async fn refresh(&self, session: &Session) {
        if let Err(e) = self.try_refresh(session).await {
            warn!(
                "Dashboard index update failed for session {}, queued for reconcile: {}",
                session.id, e
            );
            self.enqueue(&session.id);
        }
    }

    /// Write the inbox entry of the account `email` for this session
    pub async fn project_inbox(&self, session: &Session, email: &str) -> Result<(), StoreError> {
        let recipients: Vec<&Recipient> = session.recipients_for_email(email).collect();
        let recipient = recipients
            .iter()
            .find(|r| r.is_signer())
            .or_else(|| recipients.first());
        match recipient {
            Some(r) => {
                self.upsert(&inbox_key(email), DashboardIndexEntry::inbox(session, r))
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn list(&self, email: &str, now: DateTime<Utc>) -> Result<Dashboard, SigningError> {
        let sent = self.entries(&sent_key(email)).await?;
        let inbox = self.entries(&inbox_key(email)).await?;
        Ok(Dashboard {
            sent: partition_sent(sent, now),
            inbox: partition_inbox(inbox, now),
        })
    }

    /// Session ids whose projection is waiting for reconcile
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Rebuild queued projections from the session records.
    ///
    /// Returns how many sessions were reconciled; failures stay queued.
    pub async fn reconcile_pending(&self) -> usize {
        let queued: Vec<String> = match self.pending.lock() {
            Ok(mut p) => p.drain().collect(),
            Err(_) => return 0,
        };
        if queued.is_empty() {
            return 0;
        }

        let mut done = 0;
        for session_id in queued {
            match self.repo.get(&session_id).await {
                Ok(current) => match self.try_refresh(&current.value).await {
                    Ok(()) => done += 1,
                    Err(e) => {
                        warn!("Reconcile of session {} failed: {}", session_id, e);
                        self.enqueue(&session_id);
                    }
                },
                Err(SigningError::NotFound(_)) => {
                    debug!("Dropping reconcile for missing session {}", session_id);
                }
                Err(e) => {
                    warn!("Reconcile could not load session {}: {}", session_id, e);
                    self.enqueue(&session_id);
                }
            }
        }
        if done > 0 {
            info!("Reconciled dashboard index for {} session(s)", done);
        }
        done
    }

    fn enqueue(&self, session_id: &str) {
        if let Ok(mut p) = self.pending.lock() {
            p.insert(session_id.to_string());
        }
    }

    async fn entries(&self, key: &str) -> Result<Vec<DashboardIndexEntry>, SigningError> {
        Ok(self
            .repo
            .get_json::<IndexRecord>(key)
            .await?
            .map(|r| r.value.entries.into_values().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, key: &str, entry: DashboardIndexEntry) -> Result<(), StoreError> {
        for _ in 0..self.max_attempts {
            let (mut record, expect) = match self.repo.get_json::<IndexRecord>(key).await? {
                Some(current) => (current.value, Expect::Version(current.version)),
                None => (IndexRecord::default(), Expect::Absent),
            };

            if let Some(existing) = record.entries.get(&entry.session_id) {
                if existing == &entry || existing.sequence > entry.sequence {
                    return Ok(());
                }
            }
            record.entries.insert(entry.session_id.clone(), entry.clone());

            match self.repo.put_json(key, &record, expect).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict {
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{apply_decline, apply_submission};
    use crate::store::MemoryStore;
    use crate::test_support::{full_batch, sample_session, OWNER};
    use chrono::Duration;

    fn indexer() -> DashboardIndexer {
        DashboardIndexer::new(SessionRepository::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn test_email_hash_is_normalized() {
        assert_eq!(email_hash("  Bob@Example.COM "), email_hash("bob@example.com"));
        assert_eq!(email_hash("bob@example.com").len(), 64);
    }

    #[tokio::test]
    async fn test_refresh_populates_sent_and_inbox() {
        let indexer = indexer();
        let session = sample_session();
        indexer.try_refresh(&session).await.unwrap();

        let owner = indexer.list(OWNER, Utc::now()).await.unwrap();
        assert_eq!(owner.sent.in_progress.len(), 1);
        assert_eq!(owner.sent.in_progress[0].session_id, session.id);

        // Stored as Bob@Example.com on the session
        let bob = indexer.list("BOB@example.com", Utc::now()).await.unwrap();
        assert_eq!(bob.inbox.to_sign.len(), 1);
        assert!(bob.sent.in_progress.is_empty());

        // cc recipients have nothing to sign
        let carol = indexer.list("carol@example.com", Utc::now()).await.unwrap();
        assert!(carol.inbox.to_sign.is_empty());
    }

    #[tokio::test]
    async fn test_signed_recipient_moves_to_completed() {
        let indexer = indexer();
        let mut session = sample_session();
        let batch = full_batch(&session, "r1");
        apply_submission(&mut session, "r1", &batch, Utc::now()).unwrap();
        indexer.try_refresh(&session).await.unwrap();

        let alice = indexer.list("alice@example.com", Utc::now()).await.unwrap();
        assert!(alice.inbox.to_sign.is_empty());
        assert_eq!(alice.inbox.completed.len(), 1);

        let bob = indexer.list("bob@example.com", Utc::now()).await.unwrap();
        assert_eq!(bob.inbox.to_sign.len(), 1);
    }

    #[tokio::test]
    async fn test_voided_excluded_from_every_inbox_partition() {
        let indexer = indexer();
        let mut session = sample_session();
        indexer.try_refresh(&session).await.unwrap();

        session.status = SessionStatus::Voided;
        session.audit.append(
            crate::audit::AuditAction::Void,
            OWNER,
            0,
            Utc::now(),
            None,
        );
        indexer.try_refresh(&session).await.unwrap();

        let alice = indexer.list("alice@example.com", Utc::now()).await.unwrap();
        assert_eq!(alice.inbox, InboxView::default());

        let owner = indexer.list(OWNER, Utc::now()).await.unwrap();
        assert_eq!(owner.sent.voided.len(), 1);
        assert!(owner.sent.in_progress.is_empty());
    }

    #[tokio::test]
    async fn test_declined_partitions() {
        let indexer = indexer();
        let mut session = sample_session();
        apply_decline(&mut session, "r2", None, Utc::now()).unwrap();
        indexer.try_refresh(&session).await.unwrap();

        let owner = indexer.list(OWNER, Utc::now()).await.unwrap();
        assert_eq!(owner.sent.declined.len(), 1);
        let bob = indexer.list("bob@example.com", Utc::now()).await.unwrap();
        assert_eq!(bob.inbox.declined.len(), 1);
        let alice = indexer.list("alice@example.com", Utc::now()).await.unwrap();
        assert_eq!(alice.inbox.declined.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_pending_session() {
        let indexer = indexer();
        let session = sample_session();
        indexer.try_refresh(&session).await.unwrap();

        let later = session.expires_at + Duration::minutes(1);
        let owner = indexer.list(OWNER, later).await.unwrap();
        assert_eq!(owner.sent.expired.len(), 1);
        let alice = indexer.list("alice@example.com", later).await.unwrap();
        assert!(alice.inbox.to_sign.is_empty());
    }

    #[tokio::test]
    async fn test_older_projection_does_not_overwrite_newer() {
        let indexer = indexer();
        let old = sample_session();
        let mut newer = old.clone();
        let batch = full_batch(&newer, "r1");
        apply_submission(&mut newer, "r1", &batch, Utc::now()).unwrap();

        indexer.try_refresh(&newer).await.unwrap();
        indexer.try_refresh(&old).await.unwrap();

        let owner = indexer.list(OWNER, Utc::now()).await.unwrap();
        assert_eq!(owner.sent.in_progress[0].signed_count, 1);
    }

    #[test]
    fn test_partition_orders_newest_first() {
        let session = sample_session();
        let mut older = DashboardIndexEntry::sent(&session);
        older.session_id = "a".into();
        older.updated_at = session.updated_at - Duration::hours(1);
        let mut newer = DashboardIndexEntry::sent(&session);
        newer.session_id = "b".into();

        let view = partition_sent(vec![older, newer], Utc::now());
        let ids: Vec<&str> = view.in_progress.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
