//! Tamper-evident audit trail carried inside each session record.
//!
//! Revise and restart wipe signing state but never this trail: the events of
//! every earlier revision stay in place and the hash chain keeps linking them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Types of auditable session events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    Sign { recipient_id: String },
    Decline { recipient_id: String },
    Complete,
    Void,
    Revise,
    Restart,
    Associate,
}

/// A single audit entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor_email: String,
    /// Session revision the event happened in
    pub revision: u32,
    pub previous_hash: Option<String>,
    pub details: Option<String>,
}

impl AuditEvent {
    /// Compute the hash of this event (for chain linking)
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(format!("{:?}", self.action).as_bytes());
        hasher.update(self.actor_email.as_bytes());
        hasher.update(self.revision.to_be_bytes());
        if let Some(ref prev) = self.previous_hash {
            hasher.update(prev.as_bytes());
        }
        if let Some(ref details) = self.details {
            hasher.update(details.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Hash-linked sequence of events
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditTrail {
    pub events: Vec<AuditEvent>,
}

impl AuditTrail {
    /// Get the hash of the last event (for linking)
    pub fn last_hash(&self) -> Option<String> {
        self.events.last().map(|e| e.compute_hash())
    }

    /// Append an event, linking it to the previous one
    pub fn append(
        &mut self,
        action: AuditAction,
        actor_email: &str,
        revision: u32,
        at: DateTime<Utc>,
        details: Option<String>,
    ) {
        let previous_hash = self.last_hash();
        self.events.push(AuditEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: at,
            action,
            actor_email: actor_email.to_string(),
            revision,
            previous_hash,
            details,
        });
    }

    /// Verify the integrity of the chain
    pub fn verify(&self) -> Result<(), String> {
        let mut expected_prev: Option<String> = None;

        for (i, event) in self.events.iter().enumerate() {
            if event.previous_hash != expected_prev {
                return Err(format!(
                    "Chain broken at event {}: expected prev {:?}, got {:?}",
                    i, expected_prev, event.previous_hash
                ));
            }
            expected_prev = Some(event.compute_hash());
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Compute SHA-256 hash of document bytes
pub fn hash_document(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
