use std::fs;
use std::io::Write;
use std::path::Path;

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::debug;

use crate::Result;

/// Suffix of the temporary files the payload is written to
const CONFIG_FILE_SUFFIX: &str = "-statsdconf.js";

/// A single host the repeater forwards datagrams to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Transport the repeater uses when forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp4,
    Udp6,
}

impl std::str::FromStr for TransportProtocol {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            other => Err(eyre::eyre!("Unknown transport protocol '{}'", other)),
        }
    }
}

/// Configuration document the repeater process reads at launch.
///
/// Field names are the repeater's, not ours; they must serialize exactly as
/// the process expects to parse them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeaterConfig {
    /// Where received datagrams are forwarded
    pub repeater: Vec<ForwardTarget>,
    #[serde(rename = "repeaterProtocol")]
    pub repeater_protocol: TransportProtocol,
    /// Module implementing the listening transport
    pub server: String,
    /// Local port the repeater listens on
    pub port: u16,
    /// Behavior extension modules
    pub backends: Vec<String>,
}

impl RepeaterConfig {
    /// A UDP repeater listening on `port` and forwarding to a single target
    pub fn new(port: u16, target: ForwardTarget) -> Self {
        Self {
            repeater: vec![target],
            repeater_protocol: TransportProtocol::Udp4,
            server: "./servers/udp".to_string(),
            port,
            backends: vec!["./backends/repeater".to_string()],
        }
    }

    /// Writes the payload to a fresh temporary file.
    ///
    /// The file is removed when the returned path is dropped, so callers keep
    /// it for as long as the process reading it may need it.
    pub fn write_temp(&self) -> Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .suffix(CONFIG_FILE_SUFFIX)
            .tempfile()
            .wrap_err("Failed to create repeater config file")?;

        serde_json::to_writer(&mut file, self).wrap_err("Failed to serialize repeater config")?;
        file.flush()?;

        let path = file.into_temp_path();
        debug!("Wrote config file {}", path.display());
        Ok(path)
    }

    /// Reads a payload previously written by [`write_temp`](Self::write_temp)
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .wrap_err_with(|| format!("Invalid repeater config in {}", path.display()))
    }
}
