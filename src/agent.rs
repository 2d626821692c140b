//! Consumer agent assembly and serving

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::AgentConfig;
use crate::correlation::CorrelationTable;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{AgentError, AgentResult};
use crate::fatal::FatalSignal;
use crate::inbound::{self, ProxyState};
use crate::pool::{Dialer, ProviderPool};
use crate::router::RequestRouter;
use crate::sweeper::PendingSweeper;

/// Wires endpoints, balancer, pool, correlation table and router together
pub struct ConsumerAgent {
    router: Arc<RequestRouter>,
    fatal: FatalSignal,
    sweeper: Option<Arc<PendingSweeper>>,
    max_content_length: usize,
}

impl ConsumerAgent {
    pub fn new(
        config: &AgentConfig,
        endpoints: Vec<Endpoint>,
        dialer: Arc<dyn Dialer>,
    ) -> AgentResult<Self> {
        let endpoints = Arc::new(EndpointSet::new(endpoints)?);
        let balancer = config.load_balance.build(&endpoints)?;
        let table = Arc::new(CorrelationTable::new());
        let fatal = FatalSignal::new();

        let pool = ProviderPool::new(
            endpoints.clone(),
            dialer,
            table.clone(),
            fatal.clone(),
            config.max_content_length,
        );

        let sweeper = config.pending_timeout().map(|max_age| {
            Arc::new(PendingSweeper::new(
                table.clone(),
                max_age,
                config.eviction_interval(),
            ))
        });

        tracing::info!(
            endpoints = endpoints.len(),
            policy = balancer.name(),
            eviction = sweeper.is_some(),
            "Consumer agent assembled"
        );

        let router = Arc::new(RequestRouter::new(
            endpoints,
            balancer,
            pool,
            table,
            fatal.clone(),
        )?);

        Ok(Self {
            router,
            fatal,
            sweeper,
            max_content_length: config.max_content_length,
        })
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        self.router.clone()
    }

    pub fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    /// Inbound HTTP application, usable without a listener (e.g. in tests)
    pub fn inbound_app(&self) -> axum::Router {
        inbound::create_router(ProxyState {
            router: self.router.clone(),
            max_content_length: self.max_content_length,
        })
    }

    /// Serve callers on `listener` until `shutdown` resolves or a fatal
    /// condition is raised. The latter is reported as `AgentError::Fatal`.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> AgentResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper_handle = self
            .sweeper
            .clone()
            .map(|sweeper| tokio::spawn(sweeper.run()));

        let fatal = self.fatal.clone();
        let stop = async move {
            tokio::select! {
                _ = shutdown => {}
                reason = fatal.triggered() => {
                    tracing::error!(reason = %reason, "Stopping inbound listener after fatal condition");
                }
            }
        };

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Accepting inbound requests");
        }

        let app = self
            .inbound_app()
            .into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app).with_graceful_shutdown(stop).await;

        if let Some(handle) = sweeper_handle {
            handle.abort();
        }
        result?;

        match self.fatal.reason() {
            Some(reason) => Err(AgentError::Fatal(reason)),
            None => Ok(()),
        }
    }
}
