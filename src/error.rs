use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Failures a service or the harness surfaces to its caller
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} did not report readiness within {timeout:?}")]
    LaunchTimeout { service: String, timeout: Duration },

    #[error("{service} exited before reporting readiness (code: {code:?})")]
    LaunchFailed { service: String, code: Option<i32> },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to send datagram to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not ready")]
    NotReady(String),
}

/// A supervised process exited without being asked to stop.
///
/// This is fatal for the whole harness run: the subject under test is gone,
/// so nothing observed afterwards can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{service} unexpectedly quit with code: {code:?}")]
pub struct UnexpectedTermination {
    pub service: String,
    pub code: Option<i32>,
}

/// Sending half of the fault channel, handed to supervised services
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<UnexpectedTermination>,
}

impl FaultReporter {
    pub fn report(&self, fault: UnexpectedTermination) {
        if self.tx.send(fault).is_err() {
            debug!("fault monitor is gone, dropping fault report");
        }
    }
}

/// Receiving half of the fault channel, owned by whoever runs the harness
#[derive(Debug)]
pub struct FaultMonitor {
    rx: mpsc::UnboundedReceiver<UnexpectedTermination>,
}

impl FaultMonitor {
    /// Waits for the next fault. Returns `None` once every reporter is dropped.
    pub async fn next(&mut self) -> Option<UnexpectedTermination> {
        self.rx.recv().await
    }

    /// Returns a fault that has already been reported, without waiting
    pub fn try_next(&mut self) -> Option<UnexpectedTermination> {
        self.rx.try_recv().ok()
    }
}

/// Creates a connected reporter/monitor pair
pub fn fault_channel() -> (FaultReporter, FaultMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FaultReporter { tx }, FaultMonitor { rx })
}
