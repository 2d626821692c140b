//! Provider endpoints and the discovery seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use crate::error::{AgentError, AgentResult};

/// A provider instance reachable at `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,

    /// Relative share of traffic under the weighted policy
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Largest accepted endpoint weight; the weighted schedule holds one slot per unit
pub const MAX_WEIGHT: u32 = 10_000;

fn default_weight() -> u32 {
    1
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Value written into the destination header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host:port` or `host:port*weight`
impl FromStr for Endpoint {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, weight) = match s.split_once('*') {
            Some((addr, weight)) => {
                let weight = weight
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|w| (1..=MAX_WEIGHT).contains(w))
                    .ok_or_else(|| AgentError::InvalidEndpoint(s.to_string()))?;
                (addr.trim(), weight)
            }
            None => (s, default_weight()),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| AgentError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(AgentError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AgentError::InvalidEndpoint(s.to_string()))?;

        Ok(Endpoint::new(host, port).with_weight(weight))
    }
}

/// Immutable, non-empty, ordered list of provider endpoints.
///
/// An endpoint's position is its identity: the load balancer hands out
/// positions and the connection pool is indexed the same way.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn new(endpoints: Vec<Endpoint>) -> AgentResult<Self> {
        if endpoints.is_empty() {
            return Err(AgentError::NoEndpoints);
        }
        Ok(Self { endpoints })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.endpoints.iter()
    }

    pub fn weights(&self) -> Vec<u32> {
        self.endpoints.iter().map(|e| e.weight).collect()
    }
}

impl Index<usize> for EndpointSet {
    type Output = Endpoint;

    fn index(&self, index: usize) -> &Self::Output {
        &self.endpoints[index]
    }
}

/// Source of the provider list, consulted once at startup
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list_endpoints(&self) -> AgentResult<Vec<Endpoint>>;
}

/// Discovery backed by a fixed list, usually taken from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn list_endpoints(&self) -> AgentResult<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}
