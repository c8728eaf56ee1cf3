use anyhow::{Context, Result};
use std::net::UdpSocket;

/// UDP helpers for scenario tests
pub struct SocketTestUtils;

impl SocketTestUtils {
    /// Asks the OS for a UDP port that is free right now
    pub fn free_udp_port() -> Result<u16> {
        let socket = UdpSocket::bind("127.0.0.1:0").context("Failed to bind a throwaway socket")?;
        Ok(socket.local_addr()?.port())
    }

    /// Two distinct free ports: one for the repeater, one for the collector
    pub fn free_port_pair() -> Result<(u16, u16)> {
        // Hold both sockets so the OS cannot hand out the same port twice
        let first = UdpSocket::bind("127.0.0.1:0")?;
        let second = UdpSocket::bind("127.0.0.1:0")?;
        Ok((first.local_addr()?.port(), second.local_addr()?.port()))
    }

    /// Keeps a UDP port occupied until the returned socket is dropped
    pub fn occupy_udp_port() -> Result<(UdpSocket, u16)> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        Ok((socket, port))
    }
}
