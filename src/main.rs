use clap::Parser;
use eyre::eyre;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repeater_harness::{repeater_forwards_payload, Cli, Config, Result, UnexpectedTermination};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!(
        "Checking {} {:?}: {} -> {}",
        config.process.command, config.process.args, config.repeater_addr, config.collector_addr
    );

    let report = match repeater_forwards_payload(&config).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(fault) = e.downcast_ref::<UnexpectedTermination>() {
                // The subject under test died; nothing after this point is meaningful
                error!("{}", fault);
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    if report.passed() {
        info!("repeater_works: ok ({:?} forwarded unmodified)", report.payload);
        Ok(())
    } else {
        Err(eyre!(
            "repeater_works failed: expected {:?} as the first message, collected {:?}",
            report.payload,
            report.messages
        ))
    }
}
