//! Eviction of pending requests whose provider never replied

use std::sync::Arc;
use tokio::time::{Duration, interval};

use crate::correlation::CorrelationTable;

/// Periodically drops correlation entries older than a deadline
pub struct PendingSweeper {
    table: Arc<CorrelationTable>,
    max_age: Duration,
    sweep_interval: Duration,
}

impl PendingSweeper {
    pub fn new(table: Arc<CorrelationTable>, max_age: Duration, sweep_interval: Duration) -> Self {
        Self {
            table,
            max_age,
            sweep_interval,
        }
    }

    /// Start sweeping loop
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.sweep_interval);

        tracing::info!(
            max_age_secs = self.max_age.as_secs_f64(),
            interval_secs = self.sweep_interval.as_secs_f64(),
            "Pending request sweeper started"
        );

        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    /// Evict expired entries once, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let evicted = self.table.evict_older_than(self.max_age);
        if evicted.is_empty() {
            return 0;
        }

        tracing::warn!(
            count = evicted.len(),
            oldest = ?evicted.iter().min(),
            max_age_secs = self.max_age.as_secs_f64(),
            "Evicted pending requests with no reply"
        );
        crate::metrics::record_pending_evicted(evicted.len());
        crate::metrics::update_pending_requests(self.table.len());

        evicted.len()
    }
}
