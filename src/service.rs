use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::Result;

/// Coarse lifecycle of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, `start` not called yet
    NotStarted,
    /// `start` in progress
    Starting,
    /// Ready to accept work
    Running,
    /// `stop` in progress
    Stopping,
    /// Resources released
    Stopped,
}

/// A component with an observable start/stop lifecycle.
///
/// Completion of the futures returned by [`start`](ManagedService::start) and
/// [`stop`](ManagedService::stop) is the readiness and termination signal:
/// `start` resolves once, and only once the service is ready to accept work;
/// `stop` resolves once the service has released everything it holds.
/// Stopping a service that was never started resolves immediately.
#[async_trait]
pub trait ManagedService: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> ServiceState;

    /// Brings the service up and waits for it to become ready
    async fn start(&mut self) -> Result<()>;

    /// Shuts the service down and waits for its resources to be released
    async fn stop(&mut self) -> Result<()>;
}

/// Handle to a service shared between a [`ServiceSet`](crate::ServiceSet) and
/// the scenario that drives it.
pub type SharedService = Arc<Mutex<dyn ManagedService>>;

/// Wraps a service so it can be registered in a set and still be used directly.
///
/// The returned handle coerces to [`SharedService`] with `.clone()`.
pub fn shared<S: ManagedService + 'static>(service: S) -> Arc<Mutex<S>> {
    Arc::new(Mutex::new(service))
}
