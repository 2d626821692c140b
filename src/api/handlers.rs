//! Admin API request handlers

use super::models::{EndpointStats, HealthResponse, StatsResponse};
use super::routes::AppState;
use axum::{Json, extract::State, http::StatusCode};

/// GET /health - Agent health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.router.fatal().reason() {
        None => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                timestamp: chrono::Utc::now(),
                reason: None,
            }),
        ),
        Some(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "failed".to_string(),
                timestamp: chrono::Utc::now(),
                reason: Some(reason),
            }),
        ),
    }
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /stats - Endpoints, pool and correlation table state
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let router = &state.router;
    let pool = router.pool();
    let connections = pool.connections();

    let endpoints = router
        .endpoints()
        .iter()
        .enumerate()
        .map(|(index, endpoint)| {
            let connected = connections
                .and_then(|conns| conns.get(index))
                .is_some_and(|conn| !conn.is_closed());
            EndpointStats::new(index, endpoint, connected)
        })
        .collect();

    let pending_requests = router.table().len();
    crate::metrics::update_pending_requests(pending_requests);

    Json(StatsResponse {
        load_balance: router.balancer_name().to_string(),
        pool_connected: pool.is_connected(),
        pending_requests,
        next_request_id: router.next_request_id(),
        endpoints,
    })
}
