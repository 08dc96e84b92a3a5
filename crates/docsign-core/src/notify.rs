//! Outbound notifications.
//!
//! Delivery is someone else's problem: the engine hands each message to a
//! [`Notifier`] and logs failures without failing the operation that caused
//! them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Message templates the engine sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    /// New session; carries the recipient's signing link
    SigningRequest,
    /// Revise or restart; carries a fresh signing link
    DocumentUpdated,
    SessionVoided,
    SessionCompleted,
    /// Sent to the owner when a signer declines
    RecipientDeclined,
}

impl Notification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Notification::SigningRequest => "signing_request",
            Notification::DocumentUpdated => "document_updated",
            Notification::SessionVoided => "session_voided",
            Notification::SessionCompleted => "session_completed",
            Notification::RecipientDeclined => "recipient_declined",
        }
    }
}

/// Template variables
pub type Vars = BTreeMap<String, String>;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best effort. An error is logged by the caller and otherwise ignored.
    async fn send(&self, to: &str, template: Notification, vars: &Vars) -> Result<(), String>;
}

/// Notifier that only writes a log line per message
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, to: &str, template: Notification, vars: &Vars) -> Result<(), String> {
        info!(
            "Notification {} to {} (session {})",
            template.as_str(),
            to,
            vars.get("session_id").map(String::as_str).unwrap_or("-")
        );
        Ok(())
    }
}

/// Build a variable map from string pairs
pub fn vars<const N: usize>(pairs: [(&str, &str); N]) -> Vars {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
