//! Router configuration for the web server.

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Multipart framing on top of the PDF itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.pipeline.config().max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(handlers::health))
        // Documents
        .route(
            "/api/documents",
            get(handlers::list_documents).post(handlers::upload_document),
        )
        .route(
            "/api/documents/:id",
            get(handlers::get_document).delete(handlers::delete_document),
        )
        .route("/api/documents/:id/state", get(handlers::get_state))
        // Stages
        .route("/api/documents/:id/stages/:stage", post(handlers::run_stage))
        .route(
            "/api/documents/:id/stages/:stage/refine",
            post(handlers::refine_stage),
        )
        .route(
            "/api/documents/:id/stages/:stage/validate",
            post(handlers::validate_stage),
        )
        .route(
            "/api/documents/:id/stages/:stage/reset-validation",
            post(handlers::reset_validation),
        )
        .route(
            "/api/documents/:id/stages/:stage/feedback",
            get(handlers::feedback_history),
        )
        // Layout
        .route(
            "/api/documents/:id/field-boundaries",
            get(handlers::field_boundaries),
        )
        .route(
            "/api/documents/:id/fields/:field_id/region",
            put(handlers::update_field_region),
        )
        .route("/api/documents/:id/preview", get(handlers::preview))
        // Usage
        .route("/api/usage", get(handlers::usage_summary))
        .route("/api/usage/records", get(handlers::usage_records))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
