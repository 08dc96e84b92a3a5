//! Server configuration from environment variables

use std::str::FromStr;

use chrono::Duration;
use docsign_core::store::DEFAULT_MAX_RECORD_BYTES;
use docsign_core::{EngineConfig, LifecyclePolicy};
use tracing::warn;

/// Only suitable for local development
const DEV_SIGNING_SECRET: &str = "docsign-dev-secret-change-me";

const MAX_DOWNLOAD_LINK_EXPIRY_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// SQLite URL; `None` means a file in the platform data directory
    pub database_url: Option<String>,
    pub signing_secret: String,
    /// Prefix for signing and download links
    pub public_base_url: String,
    pub download_link_expiry_days: i64,
    pub allow_void_completed: bool,
    pub max_record_bytes: usize,
    /// Interval of the index reconcile task; 0 disables it
    pub index_reconcile_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            database_url: None,
            signing_secret: DEV_SIGNING_SECRET.to_string(),
            public_base_url: "http://localhost:3001".to_string(),
            download_link_expiry_days: 30,
            allow_void_completed: false,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            index_reconcile_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let signing_secret = match std::env::var("SIGNING_SECRET") {
            Ok(s) if !s.trim().is_empty() => s,
            _ => {
                warn!(
                    "SIGNING_SECRET not configured - using development secret, links are forgeable!"
                );
                defaults.signing_secret
            }
        };

        Self {
            port: env_or("PORT", defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            signing_secret,
            public_base_url: std::env::var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            download_link_expiry_days: env_or(
                "DOWNLOAD_LINK_EXPIRY_DAYS",
                defaults.download_link_expiry_days,
            ),
            allow_void_completed: env_or("ALLOW_VOID_COMPLETED", defaults.allow_void_completed),
            max_record_bytes: env_or("MAX_RECORD_BYTES", defaults.max_record_bytes),
            index_reconcile_secs: env_or("INDEX_RECONCILE_SECS", defaults.index_reconcile_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let days = self.download_link_expiry_days.max(1);
        let download_link_lifetime = match Duration::try_days(days) {
            Some(lifetime) if days <= MAX_DOWNLOAD_LINK_EXPIRY_DAYS => lifetime,
            _ => {
                warn!(
                    "DOWNLOAD_LINK_EXPIRY_DAYS={} exceeds {} days, using default",
                    days, MAX_DOWNLOAD_LINK_EXPIRY_DAYS
                );
                Duration::days(Self::default().download_link_expiry_days)
            }
        };
        EngineConfig {
            policy: LifecyclePolicy {
                allow_void_completed: self.allow_void_completed,
                ..LifecyclePolicy::default()
            },
            download_link_lifetime,
            ..EngineConfig::default()
        }
    }
}

/// Parse an environment variable, falling back (with a warning) on bad input
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("Ignoring invalid {}={:?}, using default", name, raw);
            default
        }
    }
}
