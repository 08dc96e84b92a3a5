//! Typed access to session records and secondary index records.
//!
//! There is no partial-field update: every mutation reads the whole session,
//! changes it in memory and writes it back conditionally on the version it
//! read. [`SessionRepository::update`] retries that whole cycle when another
//! writer got there first.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{SigningError, StoreError};
use crate::model::Session;
use crate::store::{BlobStore, Expect, Versioned};

/// How many read-modify-write cycles to attempt before reporting contention
pub const DEFAULT_MAX_ATTEMPTS: usize = 8;

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Result of a successful [`SessionRepository::update`]
#[derive(Debug, Clone)]
pub struct Updated<T> {
    /// The record as written
    pub session: Session,
    /// Record as read before the mutation, for change detection
    pub previous: Session,
    pub version: u64,
    pub output: T,
}

#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn BlobStore>,
    max_attempts: usize,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    // ============================================================
    // Generic JSON records
    // ============================================================

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw.value).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(Versioned {
            value,
            version: raw.version,
        }))
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expect: Expect,
    ) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.put(key, bytes, expect).await
    }

    // ============================================================
    // Sessions
    // ============================================================

    /// Store a brand-new session; `Conflict` if the id is taken
    pub async fn create(&self, session: &Session) -> Result<u64, StoreError> {
        self.put_json(&session_key(&session.id), session, Expect::Absent)
            .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Versioned<Session>, SigningError> {
        self.get_json(&session_key(session_id))
            .await?
            .ok_or_else(|| SigningError::NotFound(format!("session {}", session_id)))
    }

    /// Whole-record overwrite, conditional on the version previously read
    pub async fn put(&self, session: &Session, read_version: u64) -> Result<u64, StoreError> {
        self.put_json(
            &session_key(&session.id),
            session,
            Expect::Version(read_version),
        )
        .await
    }

    /// Read, mutate and conditionally write back, retrying on conflicts.
    ///
    /// `mutate` runs once per attempt against a fresh copy of the record. If it
    /// returns an error nothing is written and the error is returned as-is.
    /// A mutation that leaves the record unchanged is not written either.
    pub async fn update<T, F>(
        &self,
        session_id: &str,
        mut mutate: F,
    ) -> Result<Updated<T>, SigningError>
    where
        F: FnMut(&mut Session) -> Result<T, SigningError>,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.get(session_id).await?;
            let previous = current.value.clone();
            let mut session = current.value;

            let output = mutate(&mut session)?;
            if session == previous {
                return Ok(Updated {
                    session,
                    previous,
                    version: current.version,
                    output,
                });
            }

            match self.put(&session, current.version).await {
                Ok(version) => {
                    return Ok(Updated {
                        session,
                        previous,
                        version,
                        output,
                    })
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(
                        "Write conflict on session {} (attempt {}/{}), retrying",
                        session_id, attempt, self.max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SigningError::StoreUnavailable(format!(
            "session {} is under heavy concurrent modification, gave up after {} attempts",
            session_id, self.max_attempts
        )))
    }
}
