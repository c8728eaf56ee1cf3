use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::ServiceError;
use crate::Result;

/// Fire-and-forget UDP client: one datagram per `send`, no framing
#[derive(Debug, Clone)]
pub struct UdpClient {
    target: SocketAddr,
}

impl UdpClient {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Sends `payload` as a single datagram from a fresh ephemeral socket.
    ///
    /// Errors are returned as-is; a send is never retried.
    pub async fn send(&self, payload: &str) -> Result<()> {
        let addr = self.target;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ServiceError::Send { addr, source })?;
        let sent = socket
            .send_to(payload.as_bytes(), addr)
            .await
            .map_err(|source| ServiceError::Send { addr, source })?;

        debug!(%addr, bytes = sent, "sent datagram");
        Ok(())
    }
}
