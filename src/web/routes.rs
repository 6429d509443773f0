use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - JSON access to the gateway
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Pipeline steps
            .route("/generate", post(handlers::api::generate))
            .route("/execute", post(handlers::api::execute))
            .route("/summarize", post(handlers::api::summarize))
            .route("/ask", post(handlers::api::ask))
            // Ledger
            .route(
                "/history",
                get(handlers::api::history).delete(handlers::api::clear_history),
            )
            .route("/stats", get(handlers::api::stats))
            // Backends and system status
            .route("/backends", get(handlers::api::backends))
            .route("/status", get(handlers::api::system_status)),
    )
}
