//! CM datagrams over UDP.
//!
//! Every node's CM endpoint listens on the same port; a GID maps to the
//! IP address of that endpoint. IPv4 peers are carried as v4-mapped GIDs.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use rcm_core::wire::MAD_SIZE;
use rcm_core::Gid;
use rcm_services::{MadTransport, TransportError};

use crate::cm::CmContext;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, port: u16) -> Self {
        Self { socket, port }
    }

    fn peer_addr(&self, dest: Gid) -> SocketAddr {
        let v6 = dest.as_ipv6();
        let ip = match (self.socket.local_addr(), v6.to_ipv4_mapped()) {
            (Ok(SocketAddr::V4(_)), Some(v4)) => IpAddr::V4(v4),
            _ => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl MadTransport for UdpTransport {
    fn send_mad(&self, dest: Gid, mad: Bytes) -> Result<(), TransportError> {
        let addr = self.peer_addr(dest);
        match self.socket.try_send_to(&mad, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::QueueFull),
            Err(e) if e.kind() == ErrorKind::AddrNotAvailable => {
                Err(TransportError::Unreachable(dest))
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

/// Source address of a datagram as the GID the peer is known by.
pub fn source_gid(addr: SocketAddr) -> Gid {
    match addr.ip() {
        IpAddr::V4(v4) => Gid::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => Gid::from(v6),
    }
}

/// Feed datagrams from `socket` into the engine until shutdown.
pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    ctx: CmContext,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAD_SIZE * 2];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received.context("CM socket receive failed")?;
                ctx.handle_datagram(source_gid(from), &buf[..len]).await;
            }
            _ = shutdown.recv() => {
                tracing::debug!("receive loop stopping");
                return Ok(());
            }
        }
    }
}
