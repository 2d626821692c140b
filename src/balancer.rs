//! Load balancing policies over the endpoint set

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::endpoint::{EndpointSet, MAX_WEIGHT};
use crate::error::{AgentError, AgentResult};

/// Picks the endpoint index for each new request.
///
/// Implementations must be callable from any number of tasks at once and
/// always return a value in `[0, len())`.
pub trait LoadBalancer: Send + Sync {
    fn next_index(&self) -> usize;

    /// Size of the endpoint set the policy was built for
    fn len(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Selectable policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
}

impl LoadBalancePolicy {
    pub fn build(self, endpoints: &EndpointSet) -> AgentResult<Box<dyn LoadBalancer>> {
        Ok(match self {
            LoadBalancePolicy::RoundRobin => Box::new(RoundRobin::new(endpoints.len())?),
            LoadBalancePolicy::WeightedRoundRobin => {
                Box::new(WeightedRoundRobin::new(&endpoints.weights())?)
            }
        })
    }
}

/// Cyclic assignment driven by one shared counter
#[derive(Debug)]
pub struct RoundRobin {
    counter: AtomicUsize,
    size: usize,
}

impl RoundRobin {
    pub fn new(size: usize) -> AgentResult<Self> {
        Self::starting_at(size, 0)
    }

    /// Round robin whose first selection is `start mod size`
    pub fn starting_at(size: usize, start: usize) -> AgentResult<Self> {
        if size == 0 {
            return Err(AgentError::NoEndpoints);
        }
        Ok(Self {
            counter: AtomicUsize::new(start),
            size,
        })
    }
}

impl LoadBalancer for RoundRobin {
    fn next_index(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.size
    }

    fn len(&self) -> usize {
        self.size
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Weighted round robin over a precomputed, interleaved schedule.
///
/// The schedule is built with the smooth weighted algorithm so that heavy
/// endpoints are spread across the cycle rather than served in bursts.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
    schedule: Vec<usize>,
    size: usize,
}

impl WeightedRoundRobin {
    pub fn new(weights: &[u32]) -> AgentResult<Self> {
        if weights.is_empty() {
            return Err(AgentError::NoEndpoints);
        }
        if weights.contains(&0) {
            return Err(AgentError::InvalidEndpoint(
                "endpoint weight must be at least 1".to_string(),
            ));
        }
        if let Some(weight) = weights.iter().find(|w| **w > MAX_WEIGHT) {
            return Err(AgentError::InvalidEndpoint(format!(
                "endpoint weight {} exceeds the maximum of {}",
                weight, MAX_WEIGHT
            )));
        }

        Ok(Self {
            counter: AtomicUsize::new(0),
            schedule: smooth_schedule(weights),
            size: weights.len(),
        })
    }
}

fn smooth_schedule(weights: &[u32]) -> Vec<usize> {
    let total: i64 = weights.iter().map(|w| i64::from(*w)).sum();
    let mut current = vec![0i64; weights.len()];
    let mut schedule = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = 0;
        for (i, weight) in weights.iter().enumerate() {
            current[i] += i64::from(*weight);
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        schedule.push(best);
    }

    schedule
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_index(&self) -> usize {
        let slot = self.counter.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
        self.schedule[slot]
    }

    fn len(&self) -> usize {
        self.size
    }

    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }
}
