use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use docsign_api::{app, config::Config, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docsign_api=info".parse()?)
                .add_directive("docsign_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = Config::from_env();

    // Initialize application state
    info!("Initializing DocSign API...");
    let state = Arc::new(AppState::connect(&config).await?);

    if config.index_reconcile_secs > 0 {
        spawn_index_reconciler(state.clone(), Duration::from_secs(config.index_reconcile_secs));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting DocSign API on http://{}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Periodically rebuild dashboard entries whose write failed
fn spawn_index_reconciler(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let repaired = state.engine.reconcile_indexes().await;
            if repaired > 0 {
                info!("Reconciled dashboard entries for {} session(s)", repaired);
            }
        }
    });
}
