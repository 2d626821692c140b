//! Mesh Agent - consumer-side request multiplexer
//!
//! Accepts many concurrent caller requests, spreads them over a fixed set of
//! provider endpoints with one long-lived connection per endpoint, and routes
//! each out-of-order reply back to the caller that issued it.

pub mod agent;
pub mod api;
pub mod balancer;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod fatal;
pub mod inbound;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod sweeper;
pub mod wire;

pub use agent::ConsumerAgent;
pub use balancer::{LoadBalancePolicy, LoadBalancer, RoundRobin, WeightedRoundRobin};
pub use config::AgentConfig;
pub use correlation::{CorrelationTable, InboundConnection, RequestId, RequestIdGenerator};
pub use dispatcher::ResponseDispatcher;
pub use endpoint::{Discovery, Endpoint, EndpointSet, StaticDiscovery};
pub use error::{AgentError, AgentResult};
pub use fatal::FatalSignal;
pub use pool::{Dialer, ProviderConnection, ProviderPool, TcpDialer};
pub use router::RequestRouter;
pub use sweeper::PendingSweeper;
pub use wire::{OutboundRequest, ProviderReply, REQUEST_ID_HEADER};
