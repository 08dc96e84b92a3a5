//! Serving the signed artifact.
//!
//! The merged document is only materialized when someone asks for it. A
//! completed session caches its merge, tagged with the revision it was built
//! for; a restart bumps the revision and drops the cache in the same write.

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::error::{Result, SigningError, StoreError};
use crate::merger;
use crate::model::{CachedDocument, Session, SessionStatus};
use crate::repository::SessionRepository;
use crate::store::Versioned;
use crate::tokens::{DownloadRef, TokenIssuer};

/// Default lifetime of a download reference
pub const DEFAULT_LINK_LIFETIME_DAYS: i64 = 30;

/// A downloadable document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Whether every signer had signed when the artifact was produced
    pub complete: bool,
}

#[derive(Clone)]
pub struct DownloadService {
    repo: SessionRepository,
    tokens: TokenIssuer,
    link_lifetime: Duration,
}

impl DownloadService {
    pub fn new(repo: SessionRepository, tokens: TokenIssuer, link_lifetime: Duration) -> Self {
        Self {
            repo,
            tokens,
            link_lifetime,
        }
    }

    /// Final document for the session's current revision
    pub async fn download(&self, session_id: &str) -> Result<Artifact> {
        let current = self.repo.get(session_id).await?;
        self.serve(current).await
    }

    /// Download through a reference previously handed out by [`Self::download_ref`]
    pub async fn download_with_token(&self, session_id: &str, token: &str) -> Result<Artifact> {
        let claims = self.tokens.verify_download_token(token, session_id)?;
        let current = self.repo.get(session_id).await?;
        if claims.rev != current.value.revision_count {
            return Err(SigningError::TokenExpired(format!(
                "download link was issued for revision {}, document is now at revision {}",
                claims.rev, current.value.revision_count
            )));
        }
        self.serve(current).await
    }

    /// Time-scoped reference to the current revision; no merge happens here
    pub fn download_ref(&self, session: &Session) -> Result<DownloadRef> {
        let expires_at = Utc::now() + self.link_lifetime;
        Ok(self
            .tokens
            .issue_download_ref(&session.id, session.revision_count, expires_at)?)
    }

    async fn serve(&self, current: Versioned<Session>) -> Result<Artifact> {
        let Versioned {
            value: session,
            version,
        } = current;

        if session.status == SessionStatus::Completed {
            if let Some(ref cached) = session.final_document {
                if cached.revision == session.revision_count {
                    debug!("Serving cached document for session {}", session.id);
                    return Ok(Artifact {
                        file_name: session.document_name.clone(),
                        bytes: cached.bytes.clone(),
                        complete: true,
                    });
                }
            }
        }

        let (session, bytes) = merge_blocking(session).await?;

        if session.status == SessionStatus::Completed && !session.annotations.is_empty() {
            self.store_cache(&session, version, &bytes).await;
        }

        Ok(Artifact {
            file_name: session.document_name.clone(),
            complete: session.all_signers_signed(),
            bytes,
        })
    }

    /// One conditional attempt; losing the race only costs a re-merge later
    async fn store_cache(&self, session: &Session, read_version: u64, bytes: &[u8]) {
        let mut cached = session.clone();
        cached.final_document = Some(CachedDocument {
            revision: session.revision_count,
            bytes: bytes.to_vec(),
        });

        match self.repo.put(&cached, read_version).await {
            Ok(_) => debug!(
                "Cached final document for session {} at revision {}",
                session.id, session.revision_count
            ),
            Err(StoreError::Conflict { .. }) => debug!(
                "Session {} changed while merging, skipping cache write",
                session.id
            ),
            Err(e) => warn!(
                "Failed to cache final document for session {}: {}",
                session.id, e
            ),
        }
    }
}

/// Run the merge off the async executor
async fn merge_blocking(session: Session) -> Result<(Session, Vec<u8>)> {
    tokio::task::spawn_blocking(move || -> Result<(Session, Vec<u8>)> {
        let bytes = merger::merge(
            &session.base_document,
            &session.annotations,
            &session.fields,
        )?;
        Ok((session, bytes))
    })
    .await
    .map_err(|e| SigningError::StoreUnavailable(format!("merge task failed: {}", e)))?
}
