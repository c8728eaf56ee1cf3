use tracing::{info, warn};

use crate::cli::Config;
use crate::listener::UdpCollector;
use crate::service::{shared, SharedService};
use crate::session::HarnessSession;
use crate::Result;

/// What the collector saw after one payload went through the repeater
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub payload: String,
    pub messages: Vec<String>,
}

impl ScenarioReport {
    /// The payload arrived unmodified as the first collected message
    pub fn passed(&self) -> bool {
        self.messages.first() == Some(&self.payload)
    }
}

/// Sends the configured payload to the repeater and collects what arrives
/// at the forwarding target.
///
/// The services are torn down whatever happens in between; a scenario error
/// takes precedence over a teardown error.
pub async fn repeater_forwards_payload(config: &Config) -> Result<ScenarioReport> {
    let mut session = HarnessSession::set_up(config);
    let collector = shared(UdpCollector::new(config.collector_addr));
    session.add(collector.clone() as SharedService);

    let outcome = drive(&mut session, &collector, config).await;
    let teardown = session.tear_down().await;

    match (outcome, teardown) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_error)) => {
            warn!("Teardown also failed: {:#}", teardown_error);
            Err(e)
        }
    }
}

async fn drive(
    session: &mut HarnessSession,
    collector: &tokio::sync::Mutex<UdpCollector>,
    config: &Config,
) -> Result<ScenarioReport> {
    session.start().await?;
    let client = session.client()?;

    let payload = config.payload.clone();
    let window = config.collect_window;
    let messages = session
        .run(async {
            let collector = collector.lock().await;
            // The window subscribes on first poll, before the datagram leaves
            let (messages, sent) = tokio::join!(collector.collect(window), client.send(&payload));
            sent?;
            messages
        })
        .await?;

    info!("Collected {} messages", messages.len());
    Ok(ScenarioReport {
        payload: config.payload.clone(),
        messages,
    })
}
