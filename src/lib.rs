//! Lifecycle orchestration for repeater integration tests.
//!
//! A [`HarnessSession`] registers a set of [`ManagedService`]s (a spawned
//! repeater process and an in-process UDP collector), starts them one at a
//! time, drives a scenario against them and tears them down again in the
//! same order.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod process_service;
pub mod scenario;
pub mod service;
pub mod service_set;
pub mod session;

pub use cli::{Cli, Config};
pub use client::UdpClient;
pub use config::{ForwardTarget, RepeaterConfig, TransportProtocol};
pub use error::{fault_channel, FaultMonitor, FaultReporter, ServiceError, UnexpectedTermination};
pub use listener::UdpCollector;
pub use process_service::{ProcessConfig, ProcessService, ProcessState};
pub use scenario::{repeater_forwards_payload, ScenarioReport};
pub use service::{shared, ManagedService, ServiceState, SharedService};
pub use service_set::ServiceSet;
pub use session::HarnessSession;
