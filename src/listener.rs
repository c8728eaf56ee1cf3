use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::service::{ManagedService, ServiceState};
use crate::Result;

/// Largest datagram the collector accepts
const MAX_DATAGRAM: usize = 65_507;

/// Messages buffered per subscriber before the oldest are dropped
const SUBSCRIBER_CAPACITY: usize = 1024;

/// In-process UDP endpoint standing in for the collection server.
///
/// Every received datagram is decoded as text and published to the active
/// subscribers; with no subscriber it is dropped.
pub struct UdpCollector {
    name: String,
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    messages: broadcast::Sender<String>,
    receiver: Option<JoinHandle<()>>,
    state: ServiceState,
}

impl UdpCollector {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (messages, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            name: format!("collector:{}", bind_addr.port()),
            bind_addr,
            local_addr: None,
            messages,
            receiver: None,
            state: ServiceState::NotStarted,
        }
    }

    /// Address the socket is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Accumulates every message received during `window`, in arrival order.
    ///
    /// The subscription is taken before the first await, so anything that
    /// arrives after this future is first polled is included.
    pub async fn collect(&self, window: Duration) -> Result<Vec<String>> {
        if self.state != ServiceState::Running {
            return Err(ServiceError::NotReady(self.name.clone()).into());
        }

        let mut subscription = self.messages.subscribe();
        let mut collected = Vec::new();
        let deadline = sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                message = subscription.recv() => match message {
                    Ok(message) => {
                        debug!(collector = %self.name, "Received {}", message);
                        collected.push(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            collector = %self.name,
                            skipped,
                            "collection fell behind, messages lost"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        debug!(collector = %self.name, count = collected.len(), "collection window closed");
        Ok(collected)
    }
}

#[async_trait]
impl ManagedService for UdpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ServiceState {
        self.state
    }

    async fn start(&mut self) -> Result<()> {
        if self.state == ServiceState::Running {
            return Ok(());
        }
        self.state = ServiceState::Starting;

        let socket = match UdpSocket::bind(self.bind_addr).await {
            Ok(socket) => socket,
            Err(source) => {
                self.state = ServiceState::Stopped;
                return Err(ServiceError::Bind {
                    addr: self.bind_addr,
                    source,
                }
                .into());
            }
        };
        let local_addr = socket.local_addr()?;

        self.receiver = Some(tokio::spawn(receive_datagrams(
            self.name.clone(),
            socket,
            self.messages.clone(),
        )));
        self.local_addr = Some(local_addr);
        self.state = ServiceState::Running;

        info!("Fake collector listening on {}", local_addr);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(receiver) = self.receiver.take() {
            self.state = ServiceState::Stopping;
            receiver.abort();
            // The socket is owned by the task; awaiting it guarantees it is closed
            if let Err(e) = receiver.await {
                if e.is_panic() {
                    warn!(collector = %self.name, "receive task panicked: {}", e);
                }
            }
            info!(collector = %self.name, "Fake collector closed");
        }

        self.local_addr = None;
        self.state = ServiceState::Stopped;
        Ok(())
    }
}

async fn receive_datagrams(name: String, socket: UdpSocket, messages: broadcast::Sender<String>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let message = String::from_utf8_lossy(&buf[..len]).into_owned();
                debug!(collector = %name, %peer, bytes = len, "datagram received");
                // No subscribers means nobody is collecting right now
                let _ = messages.send(message);
            }
            Err(e) => {
                warn!(collector = %name, "receive failed: {}", e);
            }
        }
    }
}
