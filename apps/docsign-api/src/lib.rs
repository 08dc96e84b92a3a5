//! DocSign API Server - HTTP surface of the signing engine
//!
//! Provides REST endpoints for:
//! - Session creation and owner management (void, revise, restart)
//! - Recipient signing and declining through signing links
//! - Document delivery, merged on demand
//! - Sent/inbox dashboards

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod sqlite_store;
pub mod state;

use state::AppState;

/// Build the router with all routes and middleware
pub fn app(state: Arc<AppState>) -> Router {
    // CORS configuration for web clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Owner endpoints
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/:id", get(handlers::get_session))
        .route("/api/sessions/:id/void", post(handlers::void_session))
        .route("/api/sessions/:id/revise", post(handlers::revise))
        .route("/api/sessions/:id/restart", post(handlers::restart))
        .route("/api/sessions/:id/associate", post(handlers::associate))
        .route("/api/dashboard", get(handlers::dashboard))
        // Signer endpoints
        .route("/api/sessions/:id/signing", get(handlers::signing_view))
        .route("/api/sessions/:id/submit", post(handlers::submit))
        .route("/api/sessions/:id/decline", post(handlers::decline))
        // Document delivery
        .route("/api/sessions/:id/download", get(handlers::download))
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
