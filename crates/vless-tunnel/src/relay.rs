//! Packet relay
//!
//! Steady-state duplex copy between the virtual interface and the
//! transport:
//!
//! ```text
//!            uplink: read_packets ──▶ one binary message per packet
//! interface                                                        transport
//!          downlink: write_packets ◀── payload split into ≤ max_chunk
//! ```
//!
//! Both directions run concurrently in the caller's task. The first one to
//! finish (EOF, I/O error) or a stop request ends the relay; nothing is
//! retried here. Each direction is FIFO; there is no ordering between them.

use crate::interface::{Packet, VirtualInterface};
use crate::transport::{TransportHandle, TransportReader, TransportWriter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Largest chunk delivered to the interface per write
pub const MAX_CHUNK: usize = 16 * 1024;

/// Why the relay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// Stop was requested
    Stopped,
    /// The peer closed the transport
    TransportClosed,
    /// The host closed the interface
    InterfaceClosed,
    /// An I/O error on either side
    Failed(RelayError),
}

impl RelayExit {
    pub fn is_error(&self) -> bool {
        matches!(self, RelayExit::Failed(_))
    }
}

/// Relay I/O errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Interface read failed: {0}")]
    InterfaceRead(String),

    #[error("Interface write failed: {0}")]
    InterfaceWrite(String),

    #[error("Transport read failed: {0}")]
    TransportRead(String),

    #[error("Transport write failed: {0}")]
    TransportWrite(String),
}

/// Tunnel statistics
#[derive(Debug, Clone, Default)]
pub struct TunnelStats {
    /// Bytes sent through tunnel
    pub bytes_sent: u64,
    /// Bytes received through tunnel
    pub bytes_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Time since the last relayed byte in either direction
    pub idle: Duration,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), idle {}s",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.idle.as_secs()
        )
    }
}

/// Live counters shared between the relay and observers
#[derive(Debug)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Zero every counter, for a new attempt
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn record_received(&self, bytes: usize, packets: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(packets as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> TunnelStats {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);

        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            idle: Duration::from_millis(now.saturating_sub(last)),
        }
    }
}

impl Default for TrafficCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Duplex copy loop between an interface and a transport
pub struct RelayEngine<I: ?Sized> {
    iface: Arc<I>,
    max_chunk: usize,
    counters: Arc<TrafficCounters>,
}

impl<I: VirtualInterface + ?Sized> RelayEngine<I> {
    /// Create an engine; `max_chunk` is clamped to `1..=MAX_CHUNK`
    pub fn new(iface: Arc<I>, max_chunk: usize, counters: Arc<TrafficCounters>) -> Self {
        Self {
            iface,
            max_chunk: max_chunk.clamp(1, MAX_CHUNK),
            counters,
        }
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Relay until EOF, error, or `stop`
    ///
    /// The handle stays with the caller, which closes it afterwards.
    pub async fn run<S>(&self, handle: &mut TransportHandle<S>, stop: &CancellationToken) -> RelayExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Relay started with {}", handle.peer());
        let (writer, reader) = handle.halves();

        let exit = tokio::select! {
            biased;
            _ = stop.cancelled() => RelayExit::Stopped,
            exit = self.uplink(writer) => exit,
            exit = self.downlink(reader) => exit,
        };

        debug!("Relay ended: {:?}", exit);
        exit
    }

    async fn uplink<S>(&self, writer: &mut TransportWriter<S>) -> RelayExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packets = match self.iface.read_packets().await {
                Ok(Some(packets)) => packets,
                Ok(None) => return RelayExit::InterfaceClosed,
                Err(e) => return RelayExit::Failed(RelayError::InterfaceRead(e.to_string())),
            };

            for packet in packets.iter().filter(|p| !p.is_empty()) {
                if let Err(e) = writer.send(&packet.data).await {
                    return RelayExit::Failed(RelayError::TransportWrite(e.to_string()));
                }
                self.counters.record_sent(packet.len());
                trace!("uplink {} bytes", packet.len());
            }
        }
    }

    async fn downlink<S>(&self, reader: &mut TransportReader<S>) -> RelayExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let data = match reader.recv().await {
                Ok(Some(data)) => data,
                Ok(None) => return RelayExit::TransportClosed,
                Err(e) => return RelayExit::Failed(RelayError::TransportRead(e.to_string())),
            };
            if data.is_empty() {
                continue;
            }

            let packets: Vec<Packet> = data.chunks(self.max_chunk).map(Packet::ipv4).collect();
            let count = packets.len();

            if let Err(e) = self.iface.write_packets(packets).await {
                return RelayExit::Failed(RelayError::InterfaceWrite(e.to_string()));
            }
            self.counters.record_received(data.len(), count);
            trace!("downlink {} bytes in {} chunk(s)", data.len(), count);
        }
    }
}
