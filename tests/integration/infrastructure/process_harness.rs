use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Path of the reference repeater built alongside the tests
pub fn loopback_repeater() -> String {
    env!("CARGO_BIN_EXE_loopback-repeater").to_string()
}

/// Runs the `repeater-harness` binary as a black box
pub struct HarnessRunner {
    binary: PathBuf,
    cleanup_pids: Vec<Pid>,
}

impl HarnessRunner {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(env!("CARGO_BIN_EXE_repeater-harness")),
            cleanup_pids: Vec::new(),
        }
    }

    /// Spawn the harness with the given arguments
    pub async fn spawn(&mut self, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdout(Stdio::null());
        cmd.env("RUST_LOG", "info");

        // Own process group so cleanup reaches the repeater it launches
        cmd.process_group(0);

        let start_time = Instant::now();
        let child = cmd.spawn().context("Failed to spawn repeater-harness")?;

        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );
        self.cleanup_pids.push(pid);

        Ok(TestProcess {
            pid,
            start_time,
            child: Some(child),
        })
    }
}

impl Drop for HarnessRunner {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::killpg(*pid, Signal::SIGKILL);
        }
    }
}

/// A spawned process with timing and control helpers
pub struct TestProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: Option<tokio::process::Child>,
}

impl TestProcess {
    /// Wait for process exit with a timeout
    pub async fn wait_for_exit_timeout(
        &mut self,
        duration: Duration,
    ) -> Result<Option<ExitStatus>> {
        if let Some(child) = &mut self.child {
            match timeout(duration, child.wait()).await {
                Ok(result) => Ok(Some(result.context("Process wait failed")?)),
                Err(_) => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    /// Time since the process was spawned
    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
