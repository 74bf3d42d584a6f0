//! Virtual network interface
//!
//! The host owns the interface (TUN device, packet-flow API, test harness).
//! The tunnel only reads outbound packets from it, writes inbound packets
//! to it, and hands it the [`NetworkSettings`] for the session. It never
//! closes the interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::{Mutex, RwLock, mpsc};

/// Maximum number of queued packets returned by one [`ChannelInterface`] read
const READ_BATCH: usize = 64;

/// Network-layer protocol of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// One raw IP packet crossing the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub protocol: IpVersion,
}

impl Packet {
    /// Packet tagged as an IPv4 datagram
    pub fn ipv4(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            protocol: IpVersion::V4,
        }
    }

    /// Packet tagged from the IP version nibble (IPv4 unless it reads 6)
    pub fn from_ip_bytes(data: Vec<u8>) -> Self {
        let protocol = match data.first().map(|b| b >> 4) {
            Some(6) => IpVersion::V6,
            _ => IpVersion::V4,
        };
        Self { data, protocol }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Addressing handed to the host before the transport is negotiated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Address of the tunnel server (filled in per session)
    #[serde(skip)]
    pub tunnel_remote_address: String,
    /// Interface MTU
    pub mtu: u16,
    /// Local address assigned to the interface
    pub ipv4_address: Ipv4Addr,
    /// Netmask for `ipv4_address`
    pub ipv4_netmask: Ipv4Addr,
    /// Route all IPv4 traffic through the tunnel
    pub default_route: bool,
    /// DNS servers to use while connected
    pub dns: Vec<IpAddr>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            tunnel_remote_address: String::new(),
            mtu: 1500,
            ipv4_address: Ipv4Addr::new(192, 168, 1, 2),
            ipv4_netmask: Ipv4Addr::new(255, 255, 255, 0),
            default_route: true,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
        }
    }
}

impl NetworkSettings {
    /// Same settings, bound to a tunnel server
    pub fn for_remote(&self, remote: impl Into<String>) -> Self {
        Self {
            tunnel_remote_address: remote.into(),
            ..self.clone()
        }
    }
}

/// Host-side packet interface
///
/// Both I/O methods take `&self`: the relay reads and writes concurrently.
/// Implementations must be cancel-safe in `read_packets`.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Apply addressing/DNS for the upcoming session
    async fn apply_settings(&self, settings: &NetworkSettings) -> io::Result<()>;

    /// Next batch of outbound packets; `None` once the interface is closed
    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>>;

    /// Deliver inbound packets to the host
    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()>;
}

/// In-process interface backed by two bounded channels
///
/// The host keeps the [`InterfaceHost`] end: it pushes outbound packets in
/// and receives what the tunnel delivers.
pub struct ChannelInterface {
    outbound: Mutex<mpsc::Receiver<Packet>>,
    inbound: mpsc::Sender<Packet>,
    settings: RwLock<Option<NetworkSettings>>,
}

/// Host end of a [`ChannelInterface`]
pub struct InterfaceHost {
    /// Packets the host wants sent through the tunnel
    pub outbound: mpsc::Sender<Packet>,
    /// Packets received from the tunnel
    pub inbound: mpsc::Receiver<Packet>,
}

impl ChannelInterface {
    /// Create an interface and its host end
    pub fn pair(capacity: usize) -> (Self, InterfaceHost) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);

        let iface = Self {
            outbound: Mutex::new(out_rx),
            inbound: in_tx,
            settings: RwLock::new(None),
        };
        let host = InterfaceHost {
            outbound: out_tx,
            inbound: in_rx,
        };
        (iface, host)
    }

    /// Settings most recently applied by a session
    pub async fn applied_settings(&self) -> Option<NetworkSettings> {
        self.settings.read().await.clone()
    }
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    async fn apply_settings(&self, settings: &NetworkSettings) -> io::Result<()> {
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }

    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>> {
        let mut rx = self.outbound.lock().await;

        let Some(first) = rx.recv().await else {
            return Ok(None);
        };

        let mut batch = vec![first];
        while batch.len() < READ_BATCH {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }
        Ok(Some(batch))
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()> {
        for packet in packets {
            self.inbound.send(packet).await.map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "interface host dropped")
            })?;
        }
        Ok(())
    }
}
