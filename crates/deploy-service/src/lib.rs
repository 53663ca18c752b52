//! Deploy Service
//!
//! REST API for deploying git repositories as hosted bots and managing
//! their containers. Deployment records are persisted in Redis and
//! restored at startup.

pub mod config;
pub mod handlers;
pub mod models;
pub mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, StoreMode};
pub use handlers::{ApiError, AppState};
pub use models::{DeployRequest, DeployResponse, Plan};
pub use storage::Storage;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/deploy", post(handlers::deploy_handler))
        .route(
            "/api/deployments/{id}",
            get(handlers::get_deployment_handler).delete(handlers::delete_handler),
        )
        .route("/api/deployments/{id}/start", post(handlers::start_handler))
        .route("/api/deployments/{id}/stop", post(handlers::stop_handler))
        .route("/api/deployments/{id}/logs", get(handlers::logs_handler))
        .route(
            "/api/owners/{owner_id}/deployments",
            get(handlers::get_owner_deployments_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
