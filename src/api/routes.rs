//! Admin route definitions

use crate::router::RequestRouter;
use axum::{Router, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers;

/// Application state shared across admin handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the admin API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/stats", get(handlers::stats))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
