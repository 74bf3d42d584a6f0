//! Tunnel session
//!
//! Owns one tunnel attempt from URI to teardown:
//!
//! ```text
//! Idle ─connect─▶ Probing ─▶ Connecting ─▶ Handshaking ─▶ Relaying
//!                    │            │              │            │
//!                    ▼            ▼              ▼            ▼
//!              Failed(reason) ◀───┴──────────────┘      Disconnecting
//!                                                        │        │
//!                                                        ▼        ▼
//!                                               Disconnected   Failed(relay)
//! ```
//!
//! The session is the only writer of its [`SessionState`]. Hosts observe
//! it through [`TunnelSession::subscribe`] or a [`LifecycleObserver`],
//! which receives the coarse [`LifecycleStatus`] on every transition and
//! the error text on every failure.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (iface, host) = ChannelInterface::pair(1024);
//! let session = TunnelSession::from_settings(Arc::new(iface), ClientSettings::default());
//!
//! session.connect("vless://<uuid>@vpn.example.com:443?type=ws&path=%2Fws").await?;
//! println!("{}", session.stats().format());
//!
//! session.disconnect().await;
//! ```

use crate::config::{ConfigError, TunnelConfiguration};
use crate::handshake::{HandshakeError, greet};
use crate::interface::VirtualInterface;
use crate::relay::{RelayEngine, RelayError, RelayExit, TrafficCounters, TunnelStats};
use crate::settings::ClientSettings;
use crate::transport::{Connector, TransportError, TransportHandle, TransportNegotiator, TransportStage};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a session ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The URI was rejected
    Configuration,
    /// The reachability probe failed
    Unreachable,
    /// Negotiation failed at a stage
    Transport(TransportStage),
    /// The greeting could not be written
    Handshake,
    /// The host rejected the network settings
    Interface,
    /// I/O failed while relaying
    Relay,
    /// The attempt task died
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Configuration => f.write_str("invalid configuration"),
            FailureReason::Unreachable => f.write_str("server unreachable"),
            FailureReason::Transport(stage) => write!(f, "{stage} failed"),
            FailureReason::Handshake => f.write_str("handshake failed"),
            FailureReason::Interface => f.write_str("interface setup failed"),
            FailureReason::Relay => f.write_str("relay failed"),
            FailureReason::Aborted => f.write_str("session aborted"),
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Probing,
    Connecting,
    Handshaking,
    Relaying,
    Disconnecting,
    Disconnected,
    Failed(FailureReason),
}

impl SessionState {
    /// Is an attempt in progress?
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            SessionState::Idle | SessionState::Disconnected | SessionState::Failed(_)
        )
    }

    /// Has the last attempt ended?
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed(_))
    }

    /// Check if the tunnel is carrying traffic
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Relaying)
    }

    /// Coarse status reported to the host
    pub fn status(&self) -> LifecycleStatus {
        match self {
            SessionState::Idle | SessionState::Disconnected => LifecycleStatus::Disconnected,
            SessionState::Probing | SessionState::Connecting | SessionState::Handshaking => {
                LifecycleStatus::Connecting
            }
            SessionState::Relaying => LifecycleStatus::Connected,
            SessionState::Disconnecting => LifecycleStatus::Disconnecting,
            SessionState::Failed(reason) => LifecycleStatus::Failed(*reason),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Probing => f.write_str("probing"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Relaying => f.write_str("relaying"),
            SessionState::Disconnecting => f.write_str("disconnecting"),
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Status values delivered to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(FailureReason),
}

/// Host callback for lifecycle notifications
///
/// Called synchronously from the session's tasks; keep it short.
pub trait LifecycleObserver: Send + Sync {
    /// Every state transition
    fn on_status(&self, status: LifecycleStatus);

    /// Every failure, with the error text
    fn on_error(&self, _reason: FailureReason, _detail: &str) {}
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Server unreachable: {host}:{port}")]
    Unreachable { host: String, port: u16 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Session already active ({0})")]
    AlreadyActive(SessionState),

    #[error("Session aborted: {0}")]
    Aborted(String),

    #[error("Connection cancelled")]
    Cancelled,
}

impl SessionError {
    /// Failure state this error drives the session into, if any
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SessionError::Configuration(_) => Some(FailureReason::Configuration),
            SessionError::Unreachable { .. } => Some(FailureReason::Unreachable),
            SessionError::Transport(e) => Some(FailureReason::Transport(e.stage)),
            SessionError::Handshake(_) => Some(FailureReason::Handshake),
            SessionError::Interface(_) => Some(FailureReason::Interface),
            SessionError::Relay(_) => Some(FailureReason::Relay),
            SessionError::Aborted(_) => Some(FailureReason::Aborted),
            SessionError::AlreadyActive(_) | SessionError::Cancelled => None,
        }
    }
}

/// State shared with the attempt task
struct Shared {
    state: watch::Sender<SessionState>,
    observers: StdRwLock<Vec<Arc<dyn LifecycleObserver>>>,
    last_error: StdMutex<Option<String>>,
    counters: Arc<TrafficCounters>,
}

impl Shared {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn observers(&self) -> Vec<Arc<dyn LifecycleObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        info!("Session {} -> {}", prev, next);

        let status = next.status();
        for observer in self.observers() {
            observer.on_status(status);
        }
    }

    fn fail(&self, err: &SessionError) {
        let Some(reason) = err.failure_reason() else {
            return;
        };

        let detail = err.to_string();
        error!("Session failed: {}", detail);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(detail.clone());

        for observer in self.observers() {
            observer.on_error(reason, &detail);
        }
        self.transition(SessionState::Failed(reason));
    }
}

/// Tunnel session
///
/// One attempt at a time; a finished session (disconnected or failed)
/// accepts a new [`connect`](Self::connect). Each attempt runs in its own
/// task, so it keeps going (and stays cancellable) when the caller stops
/// waiting on `connect`.
pub struct TunnelSession<C: Connector> {
    connector: Arc<C>,
    iface: Arc<dyn VirtualInterface>,
    settings: Arc<ClientSettings>,
    shared: Arc<Shared>,
    /// Cancels the current attempt; claims happen under this lock
    attempt: StdMutex<Option<CancellationToken>>,
}

impl TunnelSession<TransportNegotiator> {
    /// Session over the network transport configured by `settings`
    pub fn from_settings(iface: Arc<dyn VirtualInterface>, settings: ClientSettings) -> Self {
        let negotiator = TransportNegotiator::new(settings.tunnel.tls.into())
            .with_user_agent(settings.tunnel.user_agent.clone());
        Self::new(negotiator, iface, settings)
    }
}

impl<C: Connector> TunnelSession<C> {
    /// Create an idle session
    pub fn new(connector: C, iface: Arc<dyn VirtualInterface>, settings: ClientSettings) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            connector: Arc::new(connector),
            iface,
            settings: Arc::new(settings),
            shared: Arc::new(Shared {
                state,
                observers: StdRwLock::new(Vec::new()),
                last_error: StdMutex::new(None),
                counters: Arc::new(TrafficCounters::new()),
            }),
            attempt: StdMutex::new(None),
        }
    }

    /// Register a lifecycle observer
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.current()
    }

    /// Watch every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Text of the most recent failure
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Traffic of the current (or last) attempt
    pub fn stats(&self) -> TunnelStats {
        self.shared.counters.snapshot()
    }

    /// Start a tunnel for `uri`
    ///
    /// Returns once the relay is running. Rejected while another attempt
    /// is active. An unparsable URI fails the session without reporting
    /// `Connecting`. Any other failure leaves the session in `Failed` with
    /// the error recorded; a concurrent [`disconnect`](Self::disconnect)
    /// makes this return [`SessionError::Cancelled`].
    ///
    /// Dropping the returned future does not stop the attempt.
    pub async fn connect(&self, uri: &str) -> Result<(), SessionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut current = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);

            let state = self.shared.current();
            if state.is_active() {
                warn!("Connect rejected: session is {}", state);
                return Err(SessionError::AlreadyActive(state));
            }

            let config = match TunnelConfiguration::parse(uri) {
                Ok(config) => config,
                Err(e) => {
                    let err = SessionError::from(e);
                    self.shared.fail(&err);
                    return Err(err);
                }
            };

            self.shared.counters.reset();
            self.shared.transition(SessionState::Probing);

            let cancel = CancellationToken::new();
            *current = Some(cancel.clone());

            let attempt = Attempt {
                connector: self.connector.clone(),
                iface: self.iface.clone(),
                settings: self.settings.clone(),
                shared: self.shared.clone(),
                cancel,
            };
            let task = tokio::spawn(attempt.run(config, ready_tx));
            tokio::spawn(supervise(self.shared.clone(), task));
        }

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Aborted(
                "attempt ended before reporting".to_string(),
            )),
        }
    }

    /// Stop the current attempt and wait until it has ended
    ///
    /// Safe to call from any task, at any stage, any number of times.
    pub async fn disconnect(&self) {
        let cancel = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(cancel) = cancel {
            debug!("Disconnect requested");
            cancel.cancel();
        }

        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| !state.is_active()).await;
    }
}

impl<C: Connector> Drop for TunnelSession<C> {
    fn drop(&mut self) {
        let current = self.attempt.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = current {
            cancel.cancel();
        }
    }
}

/// One tunnel attempt, detached from the caller of `connect`
struct Attempt<C: Connector> {
    connector: Arc<C>,
    iface: Arc<dyn VirtualInterface>,
    settings: Arc<ClientSettings>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl<C: Connector> Attempt<C> {
    /// Establish, report to `connect`, then relay until the attempt ends
    async fn run(
        self,
        config: TunnelConfiguration,
        ready: oneshot::Sender<Result<(), SessionError>>,
    ) {
        let handle = match self.establish(&config).await {
            Ok(handle) => handle,
            Err(SessionError::Cancelled) => {
                info!("Connect to {} cancelled", config.server_addr());
                if self.shared.current() != SessionState::Disconnecting {
                    self.shared.transition(SessionState::Disconnecting);
                }
                self.shared.transition(SessionState::Disconnected);
                let _ = ready.send(Err(SessionError::Cancelled));
                return;
            }
            Err(e) => {
                self.shared.fail(&e);
                let _ = ready.send(Err(e));
                return;
            }
        };

        self.shared.transition(SessionState::Relaying);
        if ready.send(Ok(())).is_err() {
            debug!("Connect caller went away; relaying anyway");
        }

        self.relay(handle).await;
    }

    /// Probe, configure the interface, negotiate, greet
    ///
    /// The handle is closed here on every failure after it was opened.
    async fn establish(
        &self,
        config: &TunnelConfiguration,
    ) -> Result<TransportHandle<C::Stream>, SessionError> {
        let timeout = self.settings.tunnel.probe_timeout();

        info!("Probing {} (timeout {:?})", config.server_addr(), timeout);
        let reachable = cancellable(
            &self.cancel,
            self.connector
                .probe(&config.server_host, config.server_port, timeout),
        )
        .await?;
        if !reachable {
            return Err(SessionError::Unreachable {
                host: config.server_host.clone(),
                port: config.server_port,
            });
        }

        self.shared.transition(SessionState::Connecting);

        let network = self.settings.network.for_remote(config.server_host.clone());
        cancellable(&self.cancel, self.iface.apply_settings(&network))
            .await?
            .map_err(|e| SessionError::Interface(e.to_string()))?;

        let mut handle = cancellable(&self.cancel, self.connector.open(config)).await??;

        self.shared.transition(SessionState::Handshaking);

        let close_timeout = self.settings.tunnel.close_timeout();
        match cancellable(&self.cancel, greet(&mut handle, config)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.close(close_timeout).await;
                Err(e.into())
            }
            Err(e) => {
                self.shared.transition(SessionState::Disconnecting);
                handle.close(close_timeout).await;
                Err(e)
            }
        }
    }

    async fn relay(self, mut handle: TransportHandle<C::Stream>) {
        let engine = RelayEngine::new(
            self.iface.clone(),
            self.settings.tunnel.effective_max_chunk(),
            self.shared.counters.clone(),
        );
        let exit = engine.run(&mut handle, &self.cancel).await;

        self.shared.transition(SessionState::Disconnecting);
        handle.close(self.settings.tunnel.close_timeout()).await;

        info!("Tunnel traffic: {}", self.shared.counters.snapshot().format());
        match exit {
            RelayExit::Failed(e) => self.shared.fail(&SessionError::Relay(e)),
            RelayExit::Stopped | RelayExit::TransportClosed | RelayExit::InterfaceClosed => {
                self.shared.transition(SessionState::Disconnected)
            }
        }
    }
}

/// Fail the session if its attempt task dies without finishing
async fn supervise(shared: Arc<Shared>, task: JoinHandle<()>) {
    let Err(e) = task.await else {
        return;
    };

    let state = shared.current();
    if state.is_active() {
        warn!("Attempt task ended abnormally in {}: {}", state, e);
        shared.fail(&SessionError::Aborted(e.to_string()));
    }
}

/// Run `fut` unless the attempt is cancelled first
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::encode_greeting;
    use crate::interface::{ChannelInterface, InterfaceHost, NetworkSettings, Packet};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const URI: &str = "vless://123e4567-e89b-12d3-a456-426614174000@vpn.example.com:8443?type=ws&path=%2Fws";
    const BUDGET: Duration = Duration::from_secs(1);

    type Server = WebSocketStream<DuplexStream>;

    #[derive(Default)]
    struct MockConnector {
        unreachable: bool,
        fail_at: Option<TransportStage>,
        hang_open: bool,
        open_delay: Option<Duration>,
        panic_open: bool,
        drop_server: bool,
        /// Greeting is refused as already sent
        pre_greeted: bool,
        /// Transport buffer too small for the greeting frame
        tiny_buffer: bool,
        opened: AtomicUsize,
        servers: Option<mpsc::UnboundedSender<Server>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Stream = DuplexStream;

        async fn probe(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
            !self.unreachable
        }

        async fn open(
            &self,
            _config: &TunnelConfiguration,
        ) -> Result<TransportHandle<DuplexStream>, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.hang_open {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic_open {
                panic!("connector blew up");
            }
            if let Some(stage) = self.fail_at {
                return Err(TransportError::new(stage, "injected"));
            }

            let capacity = if self.tiny_buffer { 8 } else { 64 * 1024 };
            let (a, b) = tokio::io::duplex(capacity);
            let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
            let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
            match &self.servers {
                Some(tx) if !self.drop_server => {
                    let _ = tx.send(server);
                }
                _ => drop(server),
            }
            let mut handle = TransportHandle::new(client, "mock");
            if self.pre_greeted {
                handle.mark_greeted();
            }
            Ok(handle)
        }
    }

    #[derive(Default)]
    struct Recorder {
        statuses: StdMutex<Vec<LifecycleStatus>>,
        errors: StdMutex<Vec<(FailureReason, String)>>,
    }

    impl LifecycleObserver for Recorder {
        fn on_status(&self, status: LifecycleStatus) {
            self.statuses.lock().unwrap().push(status);
        }

        fn on_error(&self, reason: FailureReason, detail: &str) {
            self.errors.lock().unwrap().push((reason, detail.to_string()));
        }
    }

    struct Fixture {
        session: Arc<TunnelSession<MockConnector>>,
        iface: Arc<ChannelInterface>,
        host: InterfaceHost,
        servers: mpsc::UnboundedReceiver<Server>,
        recorder: Arc<Recorder>,
    }

    fn fixture(connector: MockConnector) -> Fixture {
        let (tx, servers) = mpsc::unbounded_channel();
        let connector = MockConnector {
            servers: Some(tx),
            ..connector
        };

        let (iface, host) = ChannelInterface::pair(64);
        let iface = Arc::new(iface);
        let session = TunnelSession::new(connector, iface.clone(), ClientSettings::default());
        let recorder = Arc::new(Recorder::default());
        session.add_observer(recorder.clone());

        Fixture {
            session: Arc::new(session),
            iface,
            host,
            servers,
            recorder,
        }
    }

    /// Drain the server end, counting close frames
    async fn close_frames(server: &mut Server) -> usize {
        let mut closes = 0;
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(BUDGET, server.next()).await {
            if matches!(msg, Message::Close(_)) {
                closes += 1;
            }
        }
        closes
    }

    async fn wait_terminal(session: &TunnelSession<MockConnector>) -> SessionState {
        let mut rx = session.subscribe();
        let state = tokio::time::timeout(BUDGET, rx.wait_for(|s| s.is_terminal()))
            .await
            .expect("session did not terminate in time")
            .unwrap();
        *state
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SessionState::Idle.status(), LifecycleStatus::Disconnected);
        assert_eq!(SessionState::Probing.status(), LifecycleStatus::Connecting);
        assert_eq!(SessionState::Handshaking.status(), LifecycleStatus::Connecting);
        assert_eq!(SessionState::Relaying.status(), LifecycleStatus::Connected);
        assert_eq!(SessionState::Disconnecting.status(), LifecycleStatus::Disconnecting);
        assert_eq!(
            SessionState::Failed(FailureReason::Relay).status(),
            LifecycleStatus::Failed(FailureReason::Relay)
        );
        assert!(SessionState::Failed(FailureReason::Handshake).is_terminal());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Disconnecting.is_active());
        assert!(SessionState::Relaying.is_connected());
        assert!(!SessionState::Handshaking.is_connected());
    }

    #[tokio::test]
    async fn test_connect_relay_disconnect() {
        let Fixture {
            session,
            iface,
            mut host,
            mut servers,
            recorder,
        } = fixture(MockConnector::default());

        session.connect(URI).await.unwrap();
        assert_eq!(session.state(), SessionState::Relaying);

        let applied = iface.applied_settings().await.unwrap();
        assert_eq!(applied.tunnel_remote_address, "vpn.example.com");
        assert_eq!(applied.mtu, NetworkSettings::default().mtu);

        let mut server = servers.recv().await.unwrap();
        let greeting = server.next().await.unwrap().unwrap();
        let identity = TunnelConfiguration::parse(URI).unwrap().identity;
        assert_eq!(greeting, Message::binary(encode_greeting(&identity).to_vec()));

        host.outbound.send(Packet::ipv4(vec![0x45, 1, 2])).await.unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::binary(vec![0x45, 1, 2])
        );

        server.send(Message::binary(vec![0x45, 9])).await.unwrap();
        assert_eq!(host.inbound.recv().await.unwrap().data, vec![0x45, 9]);

        tokio::time::timeout(BUDGET, session.disconnect())
            .await
            .expect("disconnect took too long");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(close_frames(&mut server).await, 1);

        let stats = session.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.packets_received, 1);

        let statuses = recorder.statuses.lock().unwrap().clone();
        assert_eq!(statuses.first(), Some(&LifecycleStatus::Connecting));
        assert!(statuses.contains(&LifecycleStatus::Connected));
        assert!(statuses.contains(&LifecycleStatus::Disconnecting));
        assert_eq!(statuses.last(), Some(&LifecycleStatus::Disconnected));
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_invalid_uri_fails_without_io() {
        let f = fixture(MockConnector::default());

        let err = f.session.connect("http://example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(
            f.session.state(),
            SessionState::Failed(FailureReason::Configuration)
        );
        assert_eq!(f.session.connector.opened.load(Ordering::SeqCst), 0);
        assert!(f.iface.applied_settings().await.is_none());
        assert!(f.session.last_error().is_some());

        // Observers never hear "connecting" for a URI that cannot parse
        assert_eq!(
            *f.recorder.statuses.lock().unwrap(),
            vec![LifecycleStatus::Failed(FailureReason::Configuration)]
        );
        assert_eq!(f.recorder.errors.lock().unwrap()[0].0, FailureReason::Configuration);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let f = fixture(MockConnector {
            unreachable: true,
            ..Default::default()
        });

        let err = f.session.connect(URI).await.unwrap_err();
        assert!(matches!(err, SessionError::Unreachable { port: 8443, .. }));
        assert_eq!(
            f.session.state(),
            SessionState::Failed(FailureReason::Unreachable)
        );
        assert_eq!(f.session.connector.opened.load(Ordering::SeqCst), 0);

        let errors = f.recorder.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, FailureReason::Unreachable);
        assert!(errors[0].1.contains("vpn.example.com:8443"));
        assert_eq!(
            f.recorder.statuses.lock().unwrap().last(),
            Some(&LifecycleStatus::Failed(FailureReason::Unreachable))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_per_stage() {
        for stage in [
            TransportStage::Resolve,
            TransportStage::Connect,
            TransportStage::Tls,
            TransportStage::WebSocket,
        ] {
            let f = fixture(MockConnector {
                fail_at: Some(stage),
                ..Default::default()
            });

            let err = f.session.connect(URI).await.unwrap_err();
            assert!(matches!(err, SessionError::Transport(ref e) if e.stage == stage));
            assert_eq!(
                f.session.state(),
                SessionState::Failed(FailureReason::Transport(stage))
            );
        }
    }

    #[tokio::test]
    async fn test_handshake_failure_closes_transport() {
        let mut f = fixture(MockConnector {
            pre_greeted: true,
            ..Default::default()
        });

        let err = tokio::time::timeout(BUDGET, f.session.connect(URI))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::Handshake(HandshakeError::AlreadySent)));
        assert_eq!(
            f.session.state(),
            SessionState::Failed(FailureReason::Handshake)
        );

        let mut server = f.servers.recv().await.unwrap();
        assert_eq!(close_frames(&mut server).await, 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_when_peer_gone() {
        let f = fixture(MockConnector {
            drop_server: true,
            ..Default::default()
        });

        let err = tokio::time::timeout(BUDGET, f.session.connect(URI))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::Handshake(_)));
        assert_eq!(
            f.session.state(),
            SessionState::Failed(FailureReason::Handshake)
        );
    }

    #[tokio::test]
    async fn test_cancel_during_handshake_closes_transport() {
        let Fixture {
            session,
            host: _host,
            mut servers,
            recorder,
            ..
        } = fixture(MockConnector {
            tiny_buffer: true,
            ..Default::default()
        });

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect(URI).await }
        });

        let mut rx = session.subscribe();
        tokio::time::timeout(BUDGET, rx.wait_for(|s| *s == SessionState::Handshaking))
            .await
            .expect("never reached handshaking")
            .unwrap();
        let mut server = servers.recv().await.unwrap();

        let stopper = tokio::spawn({
            let session = session.clone();
            async move { session.disconnect().await }
        });
        tokio::time::timeout(BUDGET, rx.wait_for(|s| *s == SessionState::Disconnecting))
            .await
            .expect("never reached disconnecting")
            .unwrap();

        // The stalled greeting drains first, then exactly one close frame
        assert_eq!(close_frames(&mut server).await, 1);
        tokio::time::timeout(BUDGET, stopper)
            .await
            .expect("disconnect took too long")
            .unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(pending.await.unwrap(), Err(SessionError::Cancelled)));

        let statuses = recorder.statuses.lock().unwrap().clone();
        assert!(!statuses.iter().any(|s| matches!(s, LifecycleStatus::Failed(_))));
        assert_eq!(statuses.last(), Some(&LifecycleStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_abandoned_connect_stays_cancellable() {
        let f = fixture(MockConnector {
            hang_open: true,
            ..Default::default()
        });

        let abandoned = tokio::time::timeout(Duration::from_millis(100), f.session.connect(URI)).await;
        assert!(abandoned.is_err());
        assert_eq!(f.session.state(), SessionState::Connecting);

        tokio::time::timeout(BUDGET, f.session.disconnect())
            .await
            .expect("disconnect hung after an abandoned connect");
        assert_eq!(f.session.state(), SessionState::Disconnected);

        // A fresh attempt is accepted rather than rejected as active
        let next = tokio::time::timeout(Duration::from_millis(100), f.session.connect(URI)).await;
        assert!(next.is_err());
        assert_eq!(f.session.connector.opened.load(Ordering::SeqCst), 2);

        tokio::time::timeout(BUDGET, f.session.disconnect())
            .await
            .expect("disconnect took too long");
        assert_eq!(f.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_abandoned_connect_still_relays() {
        let Fixture {
            session,
            host: _host,
            mut servers,
            ..
        } = fixture(MockConnector {
            open_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let abandoned = tokio::time::timeout(Duration::from_millis(10), session.connect(URI)).await;
        assert!(abandoned.is_err());

        let mut rx = session.subscribe();
        tokio::time::timeout(BUDGET, rx.wait_for(|s| s.is_connected()))
            .await
            .expect("attempt stopped with its caller")
            .unwrap();
        let mut server = servers.recv().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(close_frames(&mut server).await, 1);
    }

    #[tokio::test]
    async fn test_attempt_panic_fails_session() {
        let f = fixture(MockConnector {
            panic_open: true,
            ..Default::default()
        });

        let err = tokio::time::timeout(BUDGET, f.session.connect(URI))
            .await
            .expect("connect hung after the attempt died")
            .unwrap_err();
        assert!(matches!(err, SessionError::Aborted(_)));
        assert_eq!(
            wait_terminal(&f.session).await,
            SessionState::Failed(FailureReason::Aborted)
        );
        assert!(f.session.last_error().unwrap().contains("panicked"));

        tokio::time::timeout(BUDGET, f.session.disconnect())
            .await
            .expect("disconnect hung after the attempt died");
    }

    #[tokio::test]
    async fn test_second_connect_rejected_and_cancel_pending() {
        let f = fixture(MockConnector {
            hang_open: true,
            ..Default::default()
        });

        let session = f.session.clone();
        let pending = tokio::spawn(async move { session.connect(URI).await });

        let mut rx = f.session.subscribe();
        rx.wait_for(|s| *s == SessionState::Connecting).await.unwrap();

        let err = f.session.connect(URI).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::AlreadyActive(SessionState::Connecting)
        ));

        let err = f.session.connect("not a uri").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(_)));
        assert_eq!(f.session.state(), SessionState::Connecting);

        tokio::time::timeout(BUDGET, f.session.disconnect())
            .await
            .expect("disconnect took too long");
        assert_eq!(f.session.state(), SessionState::Disconnected);

        let first = pending.await.unwrap();
        assert!(matches!(first, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let Fixture {
            session,
            host: _host,
            mut servers,
            ..
        } = fixture(MockConnector::default());

        session.connect(URI).await.unwrap();
        let mut server = servers.recv().await.unwrap();
        server.close(None).await.unwrap();

        assert_eq!(wait_terminal(&session).await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_relay_error_fails_session() {
        let Fixture {
            session,
            host,
            mut servers,
            recorder,
            ..
        } = fixture(MockConnector::default());

        session.connect(URI).await.unwrap();
        let InterfaceHost {
            outbound: _outbound,
            inbound,
        } = host;
        drop(inbound);

        let mut server = servers.recv().await.unwrap();
        server.send(Message::binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(
            wait_terminal(&session).await,
            SessionState::Failed(FailureReason::Relay)
        );
        assert!(session.last_error().unwrap().contains("Interface write failed"));
        assert_eq!(close_frames(&mut server).await, 1);
        assert_eq!(recorder.errors.lock().unwrap()[0].0, FailureReason::Relay);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let Fixture {
            session,
            host: _host,
            mut servers,
            ..
        } = fixture(MockConnector::default());

        session.connect(URI).await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect(URI).await.unwrap();
        assert_eq!(session.state(), SessionState::Relaying);
        assert_eq!(session.connector.opened.load(Ordering::SeqCst), 2);

        session.disconnect().await;
        let _first = servers.recv().await.unwrap();
        let mut second = servers.recv().await.unwrap();
        assert_eq!(close_frames(&mut second).await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let f = fixture(MockConnector::default());

        tokio::time::timeout(BUDGET, f.session.disconnect())
            .await
            .unwrap();
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_interface_settings_failure() {
        struct Broken;

        #[async_trait]
        impl VirtualInterface for Broken {
            async fn apply_settings(&self, _settings: &NetworkSettings) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "no routes"))
            }

            async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>> {
                Ok(None)
            }

            async fn write_packets(&self, _packets: Vec<Packet>) -> io::Result<()> {
                Ok(())
            }
        }

        let connector = MockConnector::default();
        let session = TunnelSession::new(connector, Arc::new(Broken), ClientSettings::default());

        let err = session.connect(URI).await.unwrap_err();
        assert!(matches!(err, SessionError::Interface(_)));
        assert_eq!(session.state(), SessionState::Failed(FailureReason::Interface));
        assert_eq!(session.connector.opened.load(Ordering::SeqCst), 0);
    }
}
