//! Request routing: balances, stamps and forwards each inbound request

use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::correlation::{CorrelationTable, InboundConnection, RequestId, RequestIdGenerator};
use crate::endpoint::EndpointSet;
use crate::error::{AgentError, AgentResult};
use crate::fatal::FatalSignal;
use crate::pool::ProviderPool;
use crate::wire::OutboundRequest;

/// Forwards inbound requests over the shared provider links
pub struct RequestRouter {
    endpoints: Arc<EndpointSet>,
    balancer: Box<dyn LoadBalancer>,
    pool: ProviderPool,
    table: Arc<CorrelationTable>,
    ids: RequestIdGenerator,
    fatal: FatalSignal,
}

impl RequestRouter {
    pub fn new(
        endpoints: Arc<EndpointSet>,
        balancer: Box<dyn LoadBalancer>,
        pool: ProviderPool,
        table: Arc<CorrelationTable>,
        fatal: FatalSignal,
    ) -> AgentResult<Self> {
        if balancer.len() != endpoints.len() || pool.endpoints().len() != endpoints.len() {
            return Err(AgentError::InvalidEndpoint(format!(
                "balancer covers {} endpoints, pool {}, endpoint set {}",
                balancer.len(),
                pool.endpoints().len(),
                endpoints.len()
            )));
        }

        Ok(Self {
            endpoints,
            balancer,
            pool,
            table,
            ids: RequestIdGenerator::new(),
            fatal,
        })
    }

    /// Forward `request` and register `inbound` to receive its reply.
    ///
    /// Returns once the request is queued on its provider link; the reply is
    /// delivered later by that link's dispatcher.
    pub async fn route(
        &self,
        mut request: OutboundRequest,
        inbound: InboundConnection,
    ) -> AgentResult<RequestId> {
        if self.fatal.is_triggered() {
            return Err(AgentError::ShuttingDown);
        }

        let connections = self.pool.ensure_connected().await?;

        let index = self.balancer.next_index();
        let endpoint = &self.endpoints[index];
        request.set_destination(endpoint)?;

        let id = self.ids.next();
        request.stamp_request_id(id);

        // Registered before sending so a fast reply always finds its caller
        self.table
            .put_for(id, inbound, index, request.method.clone())?;

        if let Err(e) = connections[index].send(request) {
            let _ = self.table.take(id);
            return Err(e);
        }

        crate::metrics::record_request_routed(&endpoint.authority());
        crate::metrics::update_pending_requests(self.table.len());
        tracing::debug!(
            request_id = id,
            index = index,
            endpoint = %endpoint,
            "Forwarded request"
        );

        Ok(id)
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn fatal(&self) -> &FatalSignal {
        &self.fatal
    }

    /// Id the next routed request will receive
    pub fn next_request_id(&self) -> RequestId {
        self.ids.peek()
    }
}
