//! Application state for DocSign API

use anyhow::Result;
use docsign_core::{BlobStore, SigningEngine, TokenIssuer, TracingNotifier};
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

pub struct AppState {
    pub engine: SigningEngine,
}

impl AppState {
    /// Connect to SQLite, run migrations and wire the engine
    pub async fn connect(config: &Config) -> Result<Self> {
        // Get database path from config or use default
        let db_path = config.database_url.clone().unwrap_or_else(|| {
            let data_dir = dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docsign-api");
            std::fs::create_dir_all(&data_dir).ok();
            format!("sqlite:{}/docsign.db?mode=rwc", data_dir.display())
        });

        tracing::info!("Connecting to database: {}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_path)
            .await?;

        SqliteStore::run_migrations(&pool).await?;

        let store = SqliteStore::new(pool, config.max_record_bytes);
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// State over any blob store; tests use the in-memory one
    pub fn with_store(store: Arc<dyn BlobStore>, config: &Config) -> Self {
        let tokens = TokenIssuer::new(&config.signing_secret, config.public_base_url.clone());
        let engine = SigningEngine::new(
            store,
            tokens,
            Arc::new(TracingNotifier),
            config.engine_config(),
        );
        Self { engine }
    }
}

/// Get platform-specific data directory
mod dirs {
    use std::path::PathBuf;

    pub fn data_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
