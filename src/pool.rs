//! Lazily established provider connection pool
//!
//! One persistent link per endpoint, dialed together on first use and never
//! replaced. Each link gets a writer task fed by an unbounded queue, so routers
//! never wait on socket I/O, and a dispatcher task that reads replies back.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;

use crate::correlation::CorrelationTable;
use crate::dispatcher::ResponseDispatcher;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{AgentError, AgentResult};
use crate::fatal::FatalSignal;
use crate::wire::OutboundRequest;

/// Flush threshold when batching queued requests into one write
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// Byte stream a provider link runs over
pub trait ProviderStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ProviderStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ProviderStream>;

/// Opens the byte stream for one endpoint
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> AgentResult<BoxedStream>;
}

/// Production dialer over TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, nodelay: bool) -> Self {
        Self {
            connect_timeout,
            nodelay,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> AgentResult<BoxedStream> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));

        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| AgentError::Dial {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| AgentError::Dial {
                endpoint: endpoint.to_string(),
                source,
            })?;

        stream.set_nodelay(self.nodelay)?;

        tracing::debug!(endpoint = %endpoint, "Dialed provider");
        Ok(Box::new(stream))
    }
}

/// Write handle for one pooled link
/// Cheap to clone (the queue sender is shared)
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    index: usize,
    endpoint: Endpoint,
    tx: mpsc::UnboundedSender<OutboundRequest>,
}

impl ProviderConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue a request for writing; does not wait for the write itself
    pub fn send(&self, request: OutboundRequest) -> AgentResult<()> {
        self.tx
            .send(request)
            .map_err(|_| AgentError::ConnectionClosed {
                endpoint: self.endpoint.to_string(),
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
struct InitFailure {
    endpoint: String,
    reason: String,
}

/// One connection per endpoint, created exactly once on first use
pub struct ProviderPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    endpoints: Arc<EndpointSet>,
    dialer: Arc<dyn Dialer>,
    table: Arc<CorrelationTable>,
    fatal: FatalSignal,
    max_reply_size: usize,
    // Memoizes failure as well as success: a failed pool is never retried
    state: OnceCell<Result<Vec<ProviderConnection>, InitFailure>>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        tracing::debug!("ProviderPool dropped, closing provider links");
    }
}

impl ProviderPool {
    pub fn new(
        endpoints: Arc<EndpointSet>,
        dialer: Arc<dyn Dialer>,
        table: Arc<CorrelationTable>,
        fatal: FatalSignal,
        max_reply_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                endpoints,
                dialer,
                table,
                fatal,
                max_reply_size,
                state: OnceCell::new(),
            }),
        }
    }

    /// Connect every endpoint if that has not happened yet.
    ///
    /// Once initialized this is a single atomic load. Initialization runs on
    /// its own task, so a caller dropped mid-way does not cancel it; concurrent
    /// first callers wait for the one attempt in flight and all observe its
    /// outcome.
    pub async fn ensure_connected(&self) -> AgentResult<&[ProviderConnection]> {
        if self.shared.state.get().is_none() {
            let shared = self.shared.clone();
            let init = tokio::spawn(async move {
                shared.state.get_or_init(|| shared.connect_all()).await;
            });

            if let Err(e) = init.await {
                tracing::error!(error = %e, "Provider pool initialization task failed");
                self.shared
                    .fatal
                    .trigger(format!("provider pool initialization task failed: {}", e));
            }
        }

        match self.shared.state.get() {
            Some(Ok(connections)) => Ok(connections.as_slice()),
            Some(Err(failure)) => Err(AgentError::PoolInit {
                endpoint: failure.endpoint.clone(),
                reason: failure.reason.clone(),
            }),
            None => Err(AgentError::ShuttingDown),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.shared.state.get(), Some(Ok(_)))
    }

    /// Established connections, if initialization has succeeded
    pub fn connections(&self) -> Option<&[ProviderConnection]> {
        match self.shared.state.get() {
            Some(Ok(connections)) => Some(connections.as_slice()),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.shared.endpoints
    }
}

impl PoolShared {
    async fn connect_all(&self) -> Result<Vec<ProviderConnection>, InitFailure> {
        tracing::info!(count = self.endpoints.len(), "Connecting to providers");

        // Dial everything before spawning any loop so a failure leaves nothing behind
        let mut streams = Vec::with_capacity(self.endpoints.len());
        for endpoint in self.endpoints.iter() {
            match self.dialer.dial(endpoint).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    tracing::error!(
                        endpoint = %endpoint,
                        error = %e,
                        "Connect to provider failed"
                    );
                    self.fatal
                        .trigger(format!("failed to connect to provider {}: {}", endpoint, e));
                    return Err(InitFailure {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let connections: Vec<ProviderConnection> = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| self.install(index, stream))
            .collect();

        crate::metrics::update_provider_connections(connections.len());
        tracing::info!(count = connections.len(), "Provider pool ready");

        Ok(connections)
    }

    fn install(&self, index: usize, stream: BoxedStream) -> ProviderConnection {
        let endpoint = self.endpoints[index].clone();
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            endpoint.clone(),
            writer,
            rx,
            self.fatal.clone(),
        ));
        tokio::spawn(supervise(endpoint.clone(), "writer", writer, self.fatal.clone()));

        let dispatcher = ResponseDispatcher::new(index, endpoint.clone(), self.table.clone());
        let reader = tokio::spawn(dispatcher.run(reader, self.max_reply_size, self.fatal.clone()));
        tokio::spawn(supervise(endpoint.clone(), "dispatcher", reader, self.fatal.clone()));

        ProviderConnection {
            index,
            endpoint,
            tx,
        }
    }
}

/// Raise `fatal` if a link task dies by panicking; its link is unusable then
async fn supervise(
    endpoint: Endpoint,
    task: &'static str,
    handle: JoinHandle<()>,
    fatal: FatalSignal,
) {
    if let Err(e) = handle.await
        && e.is_panic()
    {
        tracing::error!(endpoint = %endpoint, task = task, "Provider link task panicked");
        fatal.trigger(format!("{} task for provider {} panicked", task, endpoint));
    }
}

/// Drain the request queue onto the link, batching whatever is already queued
async fn write_loop<W>(
    endpoint: Endpoint,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<OutboundRequest>,
    fatal: FatalSignal,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    while let Some(request) = rx.recv().await {
        request.encode(&mut buf);
        while buf.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(next) => next.encode(&mut buf),
                Err(_) => break,
            }
        }

        let result = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(endpoint = %endpoint, error = %e, "Write to provider failed");
            fatal.trigger(format!("write to provider {} failed: {}", endpoint, e));
            return;
        }
        buf.clear();
    }

    tracing::debug!(endpoint = %endpoint, "Request queue closed, shutting down writer");
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(endpoint = %endpoint, error = %e, "Shutting down provider link failed");
    }
}
