//! Datagram transport used by the negotiation manager.

use crate::error::Result;
use crate::manager::ManagerConfig;
use async_trait::async_trait;
use log::{debug, error, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Sends and receives whole datagrams.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Tokio UDP socket with broadcast and address reuse enabled.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(config: &ManagerConfig) -> Result<Self> {
        let addr = config.socket_addr()?;

        debug!("Creating UDP socket for {}...", addr);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on {}: {}", addr, e);
        }

        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on {}: {}", addr, e);
        }

        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            debug!("Could not size receive buffer on {}: {}", addr, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(e.into());
            }
        }

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(data, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
