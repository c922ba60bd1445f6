//! JSON HTTP API over a [`Pipeline`].
//!
//! Every endpoint is a thin wrapper around one pipeline operation; errors map
//! to status codes in [`ApiError`].

mod handlers;
mod routes;

pub use handlers::ApiError;
pub use routes::create_router;

use crate::orchestrator::Pipeline;
use std::sync::Arc;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

/// Start the web server and run until the listener fails.
pub async fn serve(pipeline: Arc<Pipeline>, host: &str, port: u16) -> std::io::Result<()> {
    let app = create_router(AppState::new(pipeline));

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("Starting server at http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}
