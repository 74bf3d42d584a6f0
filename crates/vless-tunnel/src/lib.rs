//! VLESS tunnel client core
//!
//! Carries raw IP packets from a host-provided virtual interface to a
//! VLESS server over WebSocket, inside TLS, inside TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TunnelSession                         │
//! │                                                              │
//! │  URI ──▶ config ──▶ probe ──▶ TransportNegotiator ──▶ greet  │
//! │                                     │                        │
//! │  ┌──────────────────┐    ┌─────────▼─────────┐               │
//! │  │ VirtualInterface │◀──▶│    RelayEngine    │               │
//! │  │  (host-owned)    │    │ uplink / downlink │               │
//! │  └──────────────────┘    └─────────┬─────────┘               │
//! └────────────────────────────────────│─────────────────────────┘
//!                                      │
//!                                      ▼ TCP → TLS → WebSocket
//!                          ┌───────────────────────┐
//!                          │     VLESS server      │
//!                          └───────────────────────┘
//! ```
//!
//! # Features
//!
//! - **URI configuration**: `vless://<uuid>@host:port?type=ws&path=..&host=..`
//! - **Layered transport**: rustls TLS, WebSocket upgrade with a fixed
//!   header set, per-stage errors
//! - **Minimal framing**: a single 18-byte identity greeting, then raw
//!   packets, one binary message each
//! - **Explicit lifecycle**: a state machine observable through a watch
//!   channel or callbacks, with bounded-latency cancellation
//!
//! # Security
//!
//! - Server certificates are validated against the web PKI roots unless
//!   the caller opts into [`TlsPolicy::InsecureAcceptAny`]
//! - The identity UUID is the only credential and is never logged

mod config;
mod handshake;
mod interface;
mod relay;
mod session;
mod settings;
mod tls;
mod transport;

pub use config::{ConfigError, DEFAULT_PORT, TunnelConfiguration};
pub use handshake::{GREETING_LEN, HandshakeError, encode_greeting, greet};
pub use interface::{
    ChannelInterface, InterfaceHost, IpVersion, NetworkSettings, Packet, VirtualInterface,
};
pub use relay::{MAX_CHUNK, RelayEngine, RelayError, RelayExit, TrafficCounters, TunnelStats};
pub use session::{
    FailureReason, LifecycleObserver, LifecycleStatus, SessionError, SessionState, TunnelSession,
};
pub use settings::{ClientSettings, LoggingSettings, SettingsError, SettingsFormat, TunnelSettings};
pub use tls::{TlsMode, TlsPolicy};
pub use transport::{
    Connector, DEFAULT_USER_AGENT, TransportError, TransportHandle, TransportNegotiator,
    TransportReader, TransportStage, TransportWriter, build_request, probe,
};
