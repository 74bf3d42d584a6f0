//! UDP-attached packet interface
//!
//! Each datagram exchanged with one local peer is one IP packet. A TUN
//! bridge (or a test harness) sits on the other side of the socket.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use vless_tunnel::{NetworkSettings, Packet, VirtualInterface};

/// Largest datagram accepted from the peer
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpInterface {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpInterface {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl VirtualInterface for UdpInterface {
    async fn apply_settings(&self, settings: &NetworkSettings) -> io::Result<()> {
        // Routing and DNS belong to whatever owns the TUN device
        info!(
            "Interface settings for {}: {}/{} mtu {} dns {:?}",
            settings.tunnel_remote_address,
            settings.ipv4_address,
            settings.ipv4_netmask,
            settings.mtu,
            settings.dns
        );
        Ok(())
    }

    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.peer {
                debug!("Ignoring datagram from {}", from);
                continue;
            }
            buf.truncate(len);
            return Ok(Some(vec![Packet::from_ip_bytes(buf)]));
        }
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()> {
        for packet in packets {
            self.socket.send_to(&packet.data, self.peer).await?;
        }
        Ok(())
    }
}
