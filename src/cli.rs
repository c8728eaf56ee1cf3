use clap::Parser;
use eyre::eyre;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ForwardTarget, RepeaterConfig, TransportProtocol};
use crate::process_service::{ProcessConfig, DEFAULT_READINESS_MARKER};
use crate::Result;

/// Checks that datagrams sent to a repeater arrive at its forwarding target
#[derive(Parser, Debug)]
#[command(name = "repeater-harness")]
#[command(about = "Checks that datagrams sent to a repeater arrive at its forwarding target")]
#[command(version)]
pub struct Cli {
    /// Host the repeater and the fake collector run on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port the repeater listens on
    #[arg(long, default_value = "8125")]
    pub repeater_port: u16,

    /// Port the fake collector listens on
    #[arg(long, default_value = "9125")]
    pub collector_port: u16,

    /// Transport the repeater forwards with (udp4 or udp6)
    #[arg(long, default_value = "udp4")]
    pub protocol: String,

    /// Text on the repeater's stdout that signals readiness
    #[arg(long, default_value = DEFAULT_READINESS_MARKER)]
    pub readiness_marker: String,

    /// How long to wait for the readiness marker (seconds)
    #[arg(long, default_value = "10")]
    pub readiness_timeout_secs: u64,

    /// Graceful shutdown timeout before SIGKILL (seconds)
    #[arg(long, default_value = "5")]
    pub graceful_timeout_secs: u64,

    /// Collection window after sending (ms)
    #[arg(long, default_value = "100")]
    pub collect_window_ms: u64,

    /// Payload sent through the repeater
    #[arg(long, default_value = "foobar")]
    pub payload: String,

    /// Working directory for the repeater process
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Repeater command; the config file path is appended to its arguments
    pub command: String,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Runtime configuration of one harness run
#[derive(Debug, Clone)]
pub struct Config {
    /// How to launch and supervise the repeater
    pub process: ProcessConfig,
    /// Payload written for the repeater
    pub repeater: RepeaterConfig,
    /// Address the repeater accepts datagrams on
    pub repeater_addr: SocketAddr,
    /// Address the fake collector binds
    pub collector_addr: SocketAddr,
    /// How long the collector gathers messages
    pub collect_window: Duration,
    /// What the client sends
    pub payload: String,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let host: IpAddr = cli
            .host
            .parse()
            .map_err(|e| eyre!("Invalid host address '{}': {}", cli.host, e))?;

        let protocol: TransportProtocol = cli.protocol.parse()?;

        let mut repeater = RepeaterConfig::new(
            cli.repeater_port,
            ForwardTarget::new(host.to_string(), cli.collector_port),
        );
        repeater.repeater_protocol = protocol;

        Ok(Config {
            process: ProcessConfig {
                command: cli.command,
                args: cli.args,
                readiness_marker: cli.readiness_marker,
                readiness_timeout: Duration::from_secs(cli.readiness_timeout_secs),
                graceful_shutdown_timeout: Duration::from_secs(cli.graceful_timeout_secs),
                working_directory: cli.working_dir,
                environment: HashMap::new(),
            },
            repeater,
            repeater_addr: SocketAddr::new(host, cli.repeater_port),
            collector_addr: SocketAddr::new(host, cli.collector_port),
            collect_window: Duration::from_millis(cli.collect_window_ms),
            payload: cli.payload,
        })
    }

    /// Configuration for a repeater launched with `command args...` on the
    /// loopback interface, with every other setting at its default
    pub fn local(
        command: impl Into<String>,
        args: Vec<String>,
        repeater_port: u16,
        collector_port: u16,
    ) -> Self {
        let host = IpAddr::from([127, 0, 0, 1]);
        Config {
            process: ProcessConfig {
                command: command.into(),
                args,
                ..Default::default()
            },
            repeater: RepeaterConfig::new(
                repeater_port,
                ForwardTarget::new(host.to_string(), collector_port),
            ),
            repeater_addr: SocketAddr::new(host, repeater_port),
            collector_addr: SocketAddr::new(host, collector_port),
            collect_window: Duration::from_millis(100),
            payload: "foobar".to_string(),
        }
    }
}
