use eyre::WrapErr;
use tracing::{debug, error, info};

use crate::service::SharedService;
use crate::Result;

/// Ordered collection of services started and stopped one at a time.
///
/// Start and stop both walk the services in the order they were added. Stop
/// order is deliberately *not* reversed.
#[derive(Default)]
pub struct ServiceSet {
    services: Vec<SharedService>,
    started: bool,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends services to the end of the sequence. Duplicates are kept.
    pub fn add<I>(&mut self, services: I)
    where
        I: IntoIterator<Item = SharedService>,
    {
        self.services.extend(services);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// True between a fully successful `start` and the next `stop`
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Starts every service in index order, waiting for each to become ready
    /// before touching the next one.
    ///
    /// The first failure aborts the sequence; services after it are left
    /// untouched.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting {} services", self.services.len());

        for (index, service) in self.services.iter().enumerate() {
            let mut service = service.lock().await;
            let name = service.name().to_string();
            debug!(index, service = %name, "starting service");

            service
                .start()
                .await
                .wrap_err_with(|| format!("failed to start service #{} ({})", index, name))?;

            debug!(index, service = %name, "service ready");
        }

        self.started = true;
        info!("All services ready");
        Ok(())
    }

    /// Stops every service in index order, waiting for each to release its
    /// resources before touching the next one.
    ///
    /// A failing stop does not prevent the remaining services from being
    /// stopped; the first error is returned once the walk is complete.
    pub async fn stop(&mut self) -> Result<()> {
        self.started = false;
        info!("Stopping {} services", self.services.len());

        let mut first_error = None;
        for (index, service) in self.services.iter().enumerate() {
            let mut service = service.lock().await;
            let name = service.name().to_string();
            debug!(index, service = %name, "stopping service");

            if let Err(e) = service.stop().await {
                error!(index, service = %name, "failed to stop service: {:#}", e);
                first_error.get_or_insert(
                    e.wrap_err(format!("failed to stop service #{} ({})", index, name)),
                );
                continue;
            }

            debug!(index, service = %name, "service stopped");
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All services stopped");
                Ok(())
            }
        }
    }
}
