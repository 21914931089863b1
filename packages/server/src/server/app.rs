//! Application setup and router configuration.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::RuntimeKernel;
use crate::server::routes::{
    cancel_run_handler, create_conversation_handler, get_conversation_handler, get_run_handler,
    health_handler, list_runs_handler, run_events_handler, submit_run_handler, SubmitGate,
};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<RuntimeKernel>,
    /// Optional authorization/quota hook consulted before submits.
    pub submit_gate: Option<Arc<dyn SubmitGate>>,
}

/// Build the axum application.
pub fn build_app(kernel: Arc<RuntimeKernel>, submit_gate: Option<Arc<dyn SubmitGate>>) -> Router {
    let state = AppState {
        kernel,
        submit_gate,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/runs", post(submit_run_handler).get(list_runs_handler))
        .route("/api/runs/{id}", get(get_run_handler))
        .route("/api/runs/{id}/cancel", post(cancel_run_handler))
        .route("/api/runs/{id}/events", get(run_events_handler))
        .route("/api/conversations", post(create_conversation_handler))
        .route("/api/conversations/{id}", get(get_conversation_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
