//! Minimal UDP repeater speaking the harness's config format.
//!
//! Listens on the configured port and forwards every datagram, unmodified,
//! to each configured target. Prints the readiness marker once bound.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use eyre::{eyre, WrapErr};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repeater_harness::{RepeaterConfig, Result, TransportProtocol};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // stdout is reserved for the readiness marker
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("usage: loopback-repeater <config file>"))?;
    let config = RepeaterConfig::load(&path)?;

    let mut targets = Vec::with_capacity(config.repeater.len());
    for target in &config.repeater {
        let addr = resolve(&target.host, target.port, config.repeater_protocol).await?;
        targets.push(addr);
    }

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = UdpSocket::bind(listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", listen_addr))?;
    let forward_addr: SocketAddr = match config.repeater_protocol {
        TransportProtocol::Udp4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        TransportProtocol::Udp6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let forwarder = UdpSocket::bind(forward_addr).await?;

    println!("server is listening on port {}", config.port);
    info!("Forwarding to {:?}", targets);

    let mut buf = vec![0u8; 65_507];
    loop {
        let (len, peer) = listener.recv_from(&mut buf).await?;
        debug!(%peer, bytes = len, "datagram received");

        for target in &targets {
            if let Err(e) = forwarder.send_to(&buf[..len], *target).await {
                warn!("Failed to forward to {}: {}", target, e);
            }
        }
    }
}

async fn resolve(host: &str, port: u16, protocol: TransportProtocol) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .wrap_err_with(|| format!("Failed to resolve {}", host))?
        .find(|addr| match protocol {
            TransportProtocol::Udp4 => addr.is_ipv4(),
            TransportProtocol::Udp6 => addr.is_ipv6(),
        })
        .ok_or_else(|| eyre!("No {:?} address for {}", protocol, host))
}
