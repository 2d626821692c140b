//! Error types for the multiplexing core

use thiserror::Error;

use crate::correlation::RequestId;

/// Errors raised by the agent's routing, pooling and dispatch paths
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("endpoint set is empty")]
    NoEndpoints,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to dial provider {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Pool initialization failed; every caller observes the same failure
    #[error("provider pool initialization failed at {endpoint}: {reason}")]
    PoolInit { endpoint: String, reason: String },

    #[error("connection to provider {endpoint} is closed")]
    ConnectionClosed { endpoint: String },

    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    #[error("no pending request for id {0}")]
    UnknownRequestId(RequestId),

    #[error("reply carries no correlation header")]
    MissingRequestId,

    #[error("malformed correlation id '{0}'")]
    MalformedRequestId(String),

    #[error("caller for request {0} is gone")]
    InboundClosed(RequestId),

    #[error("framing error: {0}")]
    Frame(String),

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("agent is shutting down")]
    ShuttingDown,

    /// The agent stopped because a fatal condition was raised
    #[error("agent terminated: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether this error must take the whole process down.
    ///
    /// Per-reply and per-write failures are contained to the exchange they
    /// concern; everything touching the pooled links is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Dial { .. }
                | AgentError::PoolInit { .. }
                | AgentError::ConnectionClosed { .. }
                | AgentError::Frame(_)
                | AgentError::FrameTooLarge { .. }
                | AgentError::Fatal(_)
                | AgentError::Io(_)
        )
    }
}

impl From<httparse::Error> for AgentError {
    fn from(err: httparse::Error) -> Self {
        AgentError::Frame(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
