//! Process-fatal condition signalling
//!
//! A broken pooled link cannot be drained safely, so the agent stops taking
//! work and lets its supervisor restart it. Library code only raises the
//! signal; the binary decides how to exit.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, first-reason-wins fatal flag
#[derive(Debug, Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; later reasons are ignored
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let raised = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });

        if raised {
            tracing::error!(reason = %reason, "Fatal condition raised, agent must restart");
            crate::metrics::record_fatal();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolve once the signal has been raised, yielding its reason
    pub async fn triggered(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as any clone of self, so this is unreachable
                std::future::pending::<()>().await;
            }
        }
    }
}
