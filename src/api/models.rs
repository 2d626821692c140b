//! Admin API response models

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Reason the agent stopped serving, once a fatal condition was raised
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Provider link as reported by /stats
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointStats {
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub connected: bool,
}

impl EndpointStats {
    pub fn new(index: usize, endpoint: &Endpoint, connected: bool) -> Self {
        Self {
            index,
            host: endpoint.host.clone(),
            port: endpoint.port,
            weight: endpoint.weight,
            connected,
        }
    }
}

/// Snapshot of routing state
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub load_balance: String,
    pub pool_connected: bool,
    pub pending_requests: usize,
    pub next_request_id: u64,
    pub endpoints: Vec<EndpointStats>,
}
