//! Shared test fixtures: in-memory providers and a raw HTTP client

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use mesh_agent::pool::BoxedStream;
use mesh_agent::wire::ReplyDecoder;
use mesh_agent::{
    AgentConfig, AgentError, AgentResult, Dialer, Endpoint, OutboundRequest, ProviderReply,
    REQUEST_ID_HEADER, RequestId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};

pub const BASE_PORT: u16 = 30000;

/// A request as seen by an in-memory provider
#[derive(Debug)]
pub struct ReceivedRequest {
    pub port: u16,
    pub request: OutboundRequest,
}

impl ReceivedRequest {
    pub fn id(&self) -> RequestId {
        self.request.request_id().expect("request carries an id")
    }
}

/// Dialer whose providers live in memory and are driven by the test
pub struct MockDialer {
    dials: AtomicUsize,
    refuse_port: Option<u16>,
    links: Mutex<HashMap<u16, WriteHalf<DuplexStream>>>,
    requests_tx: mpsc::UnboundedSender<ReceivedRequest>,
    requests_rx: Mutex<mpsc::UnboundedReceiver<ReceivedRequest>>,
}

impl MockDialer {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            dials: AtomicUsize::new(0),
            refuse_port: None,
            links: Mutex::new(HashMap::new()),
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
        }
    }

    /// Refuse connections to `port`
    pub fn refusing(port: u16) -> Self {
        Self {
            refuse_port: Some(port),
            ..Self::new()
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Wait for the next request any provider received
    pub async fn next_request(&self) -> ReceivedRequest {
        let mut rx = self.requests_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a provider request")
            .expect("request channel closed")
    }

    pub async fn collect_requests(&self, count: usize) -> Vec<ReceivedRequest> {
        let mut received = Vec::with_capacity(count);
        for _ in 0..count {
            received.push(self.next_request().await);
        }
        received
    }

    /// Write `reply` onto the link to the provider listening on `port`
    pub async fn reply(&self, port: u16, reply: ProviderReply) {
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);
        self.write_raw(port, &buf).await;
    }

    pub async fn write_raw(&self, port: u16, data: &[u8]) {
        let mut links = self.links.lock().await;
        let writer = links.get_mut(&port).expect("no link to that provider");
        writer.write_all(data).await.expect("write to agent");
        writer.flush().await.expect("flush to agent");
    }

    /// Close the provider side of the link on `port`
    pub async fn close(&self, port: u16) {
        let mut links = self.links.lock().await;
        if let Some(mut writer) = links.remove(&port) {
            let _ = writer.shutdown().await;
        }
    }

    /// Receive `count` requests, then answer them in `order` (indices into
    /// arrival order). Each reply echoes the port and the request body.
    pub async fn answer_in_order(&self, count: usize, order: &[usize]) -> Vec<ReceivedRequest> {
        let received = self.collect_requests(count).await;
        for &position in order {
            let req = &received[position];
            self.reply(req.port, echo_reply(req)).await;
        }
        received
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, endpoint: &Endpoint) -> AgentResult<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        if self.refuse_port == Some(endpoint.port) {
            return Err(AgentError::Dial {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let (local, remote) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(remote);
        self.links.lock().await.insert(endpoint.port, writer);
        tokio::spawn(read_requests(endpoint.port, reader, self.requests_tx.clone()));

        Ok(Box::new(local))
    }
}

async fn read_requests(
    port: u16,
    mut reader: ReadHalf<DuplexStream>,
    tx: mpsc::UnboundedSender<ReceivedRequest>,
) {
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some((request, used))) = OutboundRequest::parse(&buf) {
            let _ = buf.split_to(used);
            if tx.send(ReceivedRequest { port, request }).is_err() {
                return;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Reply carrying the request's id and "<port>:<request body>"
pub fn echo_reply(received: &ReceivedRequest) -> ProviderReply {
    let mut body = format!("{}:", received.port).into_bytes();
    body.extend_from_slice(&received.request.body);
    ProviderReply::new(StatusCode::OK)
        .with_request_id(received.id())
        .with_header(
            HeaderName::from_static("x-provider-port"),
            HeaderValue::from(received.port),
        )
        .with_body(body)
}

pub fn endpoints(count: usize) -> Vec<Endpoint> {
    (0..count)
        .map(|i| Endpoint::new(format!("provider-{}", i), BASE_PORT + i as u16))
        .collect()
}

pub fn test_config(endpoints: Vec<Endpoint>) -> AgentConfig {
    AgentConfig {
        admin_port: None,
        endpoints,
        ..Default::default()
    }
}

/// Provider over real TCP that answers every request immediately
pub async fn spawn_tcp_provider(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_tcp_link(name, stream));
        }
    });

    addr
}

async fn serve_tcp_link(name: &'static str, mut stream: TcpStream) {
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some((request, used))) = OutboundRequest::parse(&buf) {
            let _ = buf.split_to(used);

            let mut body = format!("{}:", name).into_bytes();
            body.extend_from_slice(&request.body);
            let mut reply = ProviderReply::new(StatusCode::OK).with_body(body);
            if let Some(id) = request.headers.get(REQUEST_ID_HEADER) {
                reply = reply.with_header(HeaderName::from_static(REQUEST_ID_HEADER), id.clone());
            }

            let mut out = BytesMut::new();
            reply.encode(&mut out);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Send one HTTP/1.1 request to `addr` and read back the response
pub async fn send_raw(
    addr: SocketAddr,
    method: Method,
    path: &'static str,
    body: impl Into<Bytes>,
) -> ProviderReply {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = OutboundRequest::new(method, path.parse::<Uri>().unwrap())
        .with_header(http::header::HOST, HeaderValue::from_static("agent"))
        .with_body(body);
    let mut buf = BytesMut::new();
    request.encode(&mut buf);
    stream.write_all(&buf).await.unwrap();

    let mut decoder = ReplyDecoder::new(1024 * 1024);
    loop {
        if let Some(reply) = decoder.decode().unwrap() {
            return reply;
        }
        let read = decoder.fill(&mut stream).await.unwrap();
        assert!(read > 0, "agent closed the connection without replying");
    }
}
