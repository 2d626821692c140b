//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::balancer::LoadBalancePolicy;
use crate::endpoint::{Endpoint, MAX_WEIGHT};

/// Main agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_port: u16,

    /// Port for /health, /metrics and /stats; None disables the admin server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,

    /// Upper bound on aggregated request and reply bodies, in bytes
    pub max_content_length: usize,
    pub connect_timeout_ms: u64,
    pub tcp_nodelay: bool,
    pub load_balance: LoadBalancePolicy,

    /// Evict pending requests older than this; None keeps them until replied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_timeout_secs: Option<u64>,
    pub eviction_interval_secs: u64,

    pub endpoints: Vec<Endpoint>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            admin_port: Some(default_admin_port()),
            max_content_length: default_max_content_length(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tcp_nodelay: true,
            load_balance: LoadBalancePolicy::default(),
            pending_timeout_secs: None,
            eviction_interval_secs: default_eviction_interval(),
            endpoints: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("MESH_AGENT_LISTEN_PORT") {
            config.listen_port = port
                .parse()
                .context("Invalid MESH_AGENT_LISTEN_PORT value")?;
        }
        if let Ok(port) = std::env::var("MESH_AGENT_ADMIN_PORT") {
            config.admin_port = Some(port.parse().context("Invalid MESH_AGENT_ADMIN_PORT value")?);
        }
        if let Ok(endpoints) = std::env::var("MESH_AGENT_ENDPOINTS") {
            config.endpoints =
                parse_endpoint_list(&endpoints).context("Invalid MESH_AGENT_ENDPOINTS value")?;
        }
        if let Ok(timeout) = std::env::var("MESH_AGENT_PENDING_TIMEOUT_SECS") {
            config.pending_timeout_secs = Some(
                timeout
                    .parse()
                    .context("Invalid MESH_AGENT_PENDING_TIMEOUT_SECS value")?,
            );
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            anyhow::bail!("Listen port must be non-zero");
        }
        if let Some(admin_port) = self.admin_port {
            if admin_port == 0 {
                anyhow::bail!("Admin port must be non-zero");
            }
            if admin_port == self.listen_port {
                anyhow::bail!(
                    "Admin port {} conflicts with listen port",
                    admin_port
                );
            }
        }

        if self.max_content_length == 0 {
            anyhow::bail!("max_content_length must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.pending_timeout_secs == Some(0) {
            anyhow::bail!("pending_timeout_secs must be greater than zero when set");
        }
        if self.pending_timeout_secs.is_some() && self.eviction_interval_secs == 0 {
            anyhow::bail!("eviction_interval_secs must be greater than zero");
        }

        // An empty provider list can never serve a request
        if self.endpoints.is_empty() {
            anyhow::bail!("At least one provider endpoint is required");
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.host.is_empty() {
                anyhow::bail!("Endpoint host cannot be empty");
            }
            if endpoint.port == 0 {
                anyhow::bail!("Endpoint '{}' port must be non-zero", endpoint.host);
            }
            if endpoint.weight == 0 {
                anyhow::bail!("Endpoint '{}' weight must be at least 1", endpoint);
            }
            if endpoint.weight > MAX_WEIGHT {
                anyhow::bail!(
                    "Endpoint '{}' weight {} exceeds the maximum of {}",
                    endpoint,
                    endpoint.weight,
                    MAX_WEIGHT
                );
            }
            if !seen.insert((endpoint.host.as_str(), endpoint.port)) {
                anyhow::bail!("Duplicate endpoint {}", endpoint);
            }
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_secs.map(Duration::from_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Parse a comma-separated `host:port[*weight]` list
pub fn parse_endpoint_list(list: &str) -> Result<Vec<Endpoint>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse::<Endpoint>().map_err(anyhow::Error::from))
        .collect()
}

// Default functions
fn default_listen_port() -> u16 {
    20000
}
fn default_admin_port() -> u16 {
    20001
}
fn default_max_content_length() -> usize {
    1024 * 1024
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_eviction_interval() -> u64 {
    1
}
