use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::cli::Config;
use crate::client::UdpClient;
use crate::error::{fault_channel, FaultMonitor, ServiceError, UnexpectedTermination};
use crate::process_service::ProcessService;
use crate::service::{shared, SharedService};
use crate::service_set::ServiceSet;
use crate::Result;

/// One scenario's worth of services, bracketed by `set_up` and `tear_down`.
///
/// Every step driven through the session races against the fault monitor:
/// once a supervised process dies unexpectedly the session is failed for
/// good and no further step runs.
pub struct HarnessSession {
    services: ServiceSet,
    repeater: Arc<Mutex<ProcessService>>,
    config: Config,
    faults: FaultMonitor,
    failure: Option<UnexpectedTermination>,
}

impl HarnessSession {
    /// Builds the service set with the repeater registered first
    pub fn set_up(config: &Config) -> Self {
        let (reporter, faults) = fault_channel();
        let repeater = shared(ProcessService::new(
            "repeater",
            config.process.clone(),
            config.repeater.clone(),
            reporter,
        ));

        let mut services = ServiceSet::new();
        services.add([repeater.clone() as SharedService]);

        Self {
            services,
            repeater,
            config: config.clone(),
            faults,
            failure: None,
        }
    }

    /// Registers another service after the ones already present
    pub fn add(&mut self, service: SharedService) {
        self.services.add([service]);
    }

    pub fn repeater(&self) -> &Arc<Mutex<ProcessService>> {
        &self.repeater
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The fault that failed this session, if any
    pub fn failure(&self) -> Option<&UnexpectedTermination> {
        self.failure.as_ref()
    }

    /// Starts every registered service in order
    pub async fn start(&mut self) -> Result<()> {
        let Self {
            services,
            faults,
            failure,
            ..
        } = self;
        guarded(faults, failure, services.start()).await
    }

    /// Client aimed at the repeater, only handed out once every service is
    /// ready and no fault has been seen
    pub fn client(&mut self) -> Result<UdpClient> {
        if let Some(fault) = self.faults.try_next() {
            record_failure(&mut self.failure, fault);
        }
        if let Some(fault) = &self.failure {
            return Err(fault.clone().into());
        }
        if !self.services.is_started() {
            return Err(ServiceError::NotReady("harness session".to_string()).into());
        }
        Ok(UdpClient::new(self.config.repeater_addr))
    }

    /// Drives one scenario step, abandoning it if a fault arrives first
    pub async fn run<F, T>(&mut self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        guarded(&mut self.faults, &mut self.failure, step).await
    }

    /// Stops every registered service in the same order they were started
    pub async fn tear_down(mut self) -> Result<()> {
        if let Some(fault) = self.faults.try_next() {
            record_failure(&mut self.failure, fault);
        }
        self.services.stop().await
    }
}

async fn guarded<F, T>(
    faults: &mut FaultMonitor,
    failure: &mut Option<UnexpectedTermination>,
    step: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if let Some(fault) = failure {
        return Err(fault.clone().into());
    }

    tokio::select! {
        biased;

        Some(fault) = faults.next() => {
            record_failure(failure, fault.clone());
            Err(fault.into())
        }
        result = step => result,
    }
}

fn record_failure(failure: &mut Option<UnexpectedTermination>, fault: UnexpectedTermination) {
    error!("Harness failed: {}", fault);
    failure.get_or_insert(fault);
    info!("No further scenario steps will run");
}
