//! Layered transport: TCP → TLS → WebSocket
//!
//! [`TransportNegotiator`] opens the stack for a [`TunnelConfiguration`]
//! and yields a [`TransportHandle`], a duplex byte pipe whose WebSocket
//! framing is applied on write and stripped on read. Control frames never
//! reach the caller; pings are answered by the WebSocket layer while the
//! handle is being read.
//!
//! No stage retries. Only the reachability [`probe`] carries a deadline.

use crate::config::TunnelConfiguration;
use crate::tls::TlsPolicy;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use url::Url;

/// User-Agent presented during the upgrade
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Stage of the transport stack that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    Resolve,
    Connect,
    Tls,
    WebSocket,
}

impl fmt::Display for TransportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportStage::Resolve => "DNS resolution",
            TransportStage::Connect => "TCP connect",
            TransportStage::Tls => "TLS handshake",
            TransportStage::WebSocket => "WebSocket upgrade",
        };
        f.write_str(name)
    }
}

/// Transport negotiation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {cause}")]
pub struct TransportError {
    pub stage: TransportStage,
    pub cause: String,
}

impl TransportError {
    pub fn new(stage: TransportStage, cause: impl Into<String>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}

/// TCP connect-and-close reachability check
///
/// No protocol bytes are exchanged. Returns `false` on refusal, resolution
/// failure, or when `timeout` elapses first.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let target = format!("{host}:{port}");
    reachable_within(&target, timeout, TcpStream::connect((host, port))).await
}

async fn reachable_within<F, T>(target: &str, timeout: Duration, connect: F) -> bool
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => {
            debug!("Probe to {} succeeded", target);
            true
        }
        Ok(Err(e)) => {
            debug!("Probe to {} failed: {}", target, e);
            false
        }
        Err(_) => {
            debug!("Probe to {} timed out after {:?}", target, timeout);
            false
        }
    }
}

/// Write half of a [`TransportHandle`]
pub struct TransportWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TransportWriter<S> {
    /// Send one chunk as a single binary message
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.sink
            .send(Message::binary(data.to_vec()))
            .await
            .map_err(ws_to_io)
    }
}

/// Read half of a [`TransportHandle`]
pub struct TransportReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TransportReader<S> {
    /// Next payload from the peer; `None` once the peer closed
    pub async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ws_to_io(e)),
            }
        }
    }
}

/// Open, upgraded transport owned by one session
pub struct TransportHandle<S> {
    peer: String,
    writer: TransportWriter<S>,
    reader: TransportReader<S>,
    greeted: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TransportHandle<S> {
    /// Wrap an already-upgraded WebSocket stream
    pub fn new(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            peer: peer.into(),
            writer: TransportWriter { sink },
            reader: TransportReader { stream },
            greeted: false,
        }
    }

    /// Remote endpoint, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Borrow both directions at once
    pub fn halves(&mut self) -> (&mut TransportWriter<S>, &mut TransportReader<S>) {
        (&mut self.writer, &mut self.reader)
    }

    /// Has the identity greeting been written?
    pub fn is_greeted(&self) -> bool {
        self.greeted
    }

    pub(crate) fn writer(&mut self) -> &mut TransportWriter<S> {
        &mut self.writer
    }

    pub(crate) fn mark_greeted(&mut self) {
        self.greeted = true;
    }

    /// Close the transport
    ///
    /// Consumes the handle. Sends a WebSocket close frame, bounded by
    /// `grace`; failures are logged and otherwise ignored.
    pub async fn close(self, grace: Duration) {
        let Self {
            peer,
            mut writer,
            reader,
            ..
        } = self;

        match tokio::time::timeout(grace, writer.sink.close()).await {
            Ok(Ok(())) => debug!("Transport to {} closed", peer),
            Ok(Err(e)) => debug!("Transport to {} closed with error: {}", peer, e),
            Err(_) => warn!("Timed out closing transport to {}", peer),
        }
        drop(reader);
    }
}

impl<S> fmt::Debug for TransportHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("peer", &self.peer)
            .field("greeted", &self.greeted)
            .finish()
    }
}

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "WebSocket closed")
        }
        other => io::Error::other(other.to_string()),
    }
}

/// Opens transports for a session
///
/// [`TransportNegotiator`] is the network implementation; tests and hosts
/// with their own stacks plug in here.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Reachability check run before negotiation
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        probe(host, port, timeout).await
    }

    /// Negotiate the full stack
    async fn open(
        &self,
        config: &TunnelConfiguration,
    ) -> Result<TransportHandle<Self::Stream>, TransportError>;
}

/// TCP + TLS + WebSocket negotiator
#[derive(Clone)]
pub struct TransportNegotiator {
    policy: TlsPolicy,
    tls_config: Arc<rustls::ClientConfig>,
    user_agent: String,
}

impl TransportNegotiator {
    /// Create a negotiator with the given certificate policy
    pub fn new(policy: TlsPolicy) -> Self {
        if policy.is_insecure() {
            warn!("TLS certificate verification is DISABLED for this tunnel");
        }
        let tls_config = Arc::new(policy.client_config());
        Self {
            policy,
            tls_config,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Override the User-Agent header
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    async fn connect_tcp(config: &TunnelConfiguration) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((config.server_host.as_str(), config.server_port))
                .await
                .map_err(|e| TransportError::new(TransportStage::Resolve, e.to_string()))?
                .collect();

        if addrs.is_empty() {
            return Err(TransportError::new(
                TransportStage::Resolve,
                format!("no addresses for {}", config.server_host),
            ));
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    debug!("TCP connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("TCP connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::new(
            TransportStage::Connect,
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

impl Default for TransportNegotiator {
    fn default() -> Self {
        Self::new(TlsPolicy::default())
    }
}

impl fmt::Debug for TransportNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportNegotiator")
            .field("policy", &self.policy)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[async_trait]
impl Connector for TransportNegotiator {
    type Stream = TlsStream<TcpStream>;

    async fn open(
        &self,
        config: &TunnelConfiguration,
    ) -> Result<TransportHandle<Self::Stream>, TransportError> {
        let tcp = Self::connect_tcp(config).await?;

        let server_name = ServerName::try_from(config.server_host.clone())
            .map_err(|e| TransportError::new(TransportStage::Tls, format!("invalid server name: {e}")))?;
        let tls = TlsConnector::from(self.tls_config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::new(TransportStage::Tls, e.to_string()))?;
        debug!("TLS established with {}", config.server_host);

        let request = build_request(config, &self.user_agent)?;
        let (ws, response) = tokio_tungstenite::client_async(request, tls)
            .await
            .map_err(|e| TransportError::new(TransportStage::WebSocket, e.to_string()))?;
        debug!(
            "WebSocket upgraded (status {}, path {})",
            response.status(),
            config.request_path
        );

        Ok(TransportHandle::new(ws, config.server_addr()))
    }
}

/// Upgrade request with the fixed header set
///
/// The request path is stored decoded; it is percent-encoded again here.
/// Anything after the first `?` becomes the request query.
pub fn build_request(
    config: &TunnelConfiguration,
    user_agent: &str,
) -> Result<Request<()>, TransportError> {
    let mut target = Url::parse(&format!(
        "wss://{}:{}/",
        config.authority_host(),
        config.server_port
    ))
    .map_err(|e| TransportError::new(TransportStage::WebSocket, e.to_string()))?;

    match config.request_path.split_once('?') {
        Some((path, query)) => {
            target.set_path(path);
            target.set_query(Some(query));
        }
        None => target.set_path(&config.request_path),
    }

    Request::builder()
        .method("GET")
        .uri(target.as_str())
        .header("Host", config.ws_host.as_str())
        .header("User-Agent", user_agent)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| TransportError::new(TransportStage::WebSocket, e.to_string()))
}
