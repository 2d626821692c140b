//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a request forwarded to a provider
pub fn record_request_routed(endpoint: &str) {
    metrics::counter!("mesh_agent_requests_routed_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a reply handed back to its caller
pub fn record_reply_dispatched() {
    metrics::counter!("mesh_agent_replies_dispatched_total").increment(1);
}

/// Record a reply that could not be delivered
pub fn record_reply_dropped(reason: &'static str) {
    metrics::counter!("mesh_agent_replies_dropped_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record pending requests evicted by the sweeper
pub fn record_pending_evicted(count: usize) {
    metrics::counter!("mesh_agent_pending_evicted_total").increment(count as u64);
}

/// Update the pending correlation entries gauge
pub fn update_pending_requests(count: usize) {
    metrics::gauge!("mesh_agent_pending_requests").set(count as f64);
}

/// Update the established provider connections gauge
pub fn update_provider_connections(count: usize) {
    metrics::gauge!("mesh_agent_provider_connections").set(count as f64);
}

/// Record a fatal condition
pub fn record_fatal() {
    metrics::counter!("mesh_agent_fatal_total").increment(1);
}
