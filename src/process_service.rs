use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ForwardTarget, RepeaterConfig};
use crate::error::{FaultReporter, ServiceError, UnexpectedTermination};
use crate::service::{ManagedService, ServiceState};
use crate::Result;

/// Output line that tells us the repeater accepts datagrams
pub const DEFAULT_READINESS_MARKER: &str = "server is listening";

/// Relayed stderr lines buffered per subscriber
const STDERR_CAPACITY: usize = 256;

/// Consecutive read errors after which an output pipe is abandoned
const MAX_READ_ERRORS: usize = 8;

/// Configuration for launching and supervising the repeater process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments placed before the config file path
    pub args: Vec<String>,
    /// Substring of a stdout line that signals readiness
    pub readiness_marker: String,
    /// How long to wait for the readiness marker
    pub readiness_timeout: Duration,
    /// How long to wait after SIGTERM before SIGKILL
    pub graceful_shutdown_timeout: Duration,
    /// Working directory for the process
    pub working_directory: Option<PathBuf>,
    /// Environment variables to set on top of the inherited ones
    pub environment: HashMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["stats.js".to_string()],
            readiness_marker: DEFAULT_READINESS_MARKER.to_string(),
            readiness_timeout: Duration::from_secs(10),
            graceful_shutdown_timeout: Duration::from_secs(5),
            working_directory: None,
            environment: HashMap::new(),
        }
    }
}

/// State of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing spawned yet
    Idle,
    /// Spawned, waiting for the readiness marker
    Launching,
    /// Readiness marker seen
    Ready,
    /// Accepting work
    Active,
    /// Termination requested, waiting for exit
    Stopping,
    /// Process has exited
    Terminated,
}

impl From<ProcessState> for ServiceState {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Idle => ServiceState::NotStarted,
            ProcessState::Launching | ProcessState::Ready => ServiceState::Starting,
            ProcessState::Active => ServiceState::Running,
            ProcessState::Stopping => ServiceState::Stopping,
            ProcessState::Terminated => ServiceState::Stopped,
        }
    }
}

/// Spawns the repeater and supervises it until it is asked to stop.
///
/// The child is owned by an exit-watcher task. If the child exits while no
/// stop was requested, the watcher reports an [`UnexpectedTermination`] on
/// the fault channel; deciding what to do about it is up to the harness.
pub struct ProcessService {
    name: String,
    config: ProcessConfig,
    payload: RepeaterConfig,
    faults: FaultReporter,
    state: ProcessState,
    pid: Option<Pid>,
    /// Kept alive until the process is gone
    config_file: Option<TempPath>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    exit_watcher: Option<JoinHandle<Option<ExitStatus>>>,
    stderr_lines: broadcast::Sender<String>,
}

impl ProcessService {
    pub fn new(
        name: impl Into<String>,
        config: ProcessConfig,
        payload: RepeaterConfig,
        faults: FaultReporter,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            payload,
            faults,
            state: ProcessState::Idle,
            pid: None,
            config_file: None,
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            exit_watcher: None,
            stderr_lines: broadcast::channel(STDERR_CAPACITY).0,
        }
    }

    /// Port the repeater listens on
    pub fn listen_port(&self) -> u16 {
        self.payload.port
    }

    /// Hosts the repeater forwards to
    pub fn forward_targets(&self) -> &[ForwardTarget] {
        &self.payload.repeater
    }

    /// Current state; an active process that has since exited reads as terminated
    pub fn process_state(&self) -> ProcessState {
        match self.state {
            ProcessState::Active if !self.is_running() => ProcessState::Terminated,
            state => state,
        }
    }

    /// Every stderr line relayed after this call, newline stripped
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        self.stderr_lines.subscribe()
    }

    /// Pid of the live subprocess, which also leads its own process group
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// True while the subprocess has not exited
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_process(&mut self) -> Result<oneshot::Receiver<()>> {
        let config_path = self.payload.write_temp()?;
        info!(
            service = %self.name,
            "Starting repeater listening on {} forwarding to {:?}",
            self.payload.port,
            self.payload.repeater
        );

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        command.arg(&*config_path);

        // Own process group so termination reaches anything the command forks
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if let Some(ref work_dir) = self.config.working_directory {
            command.current_dir(work_dir);
        }
        command.envs(&self.config.environment);

        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {}", self.config.command))?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID")),
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("stdout of {} was not captured", self.name))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("stderr of {} was not captured", self.name))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(watch_stdout(
            self.name.clone(),
            stdout,
            self.config.readiness_marker.clone(),
            ready_tx,
        ));
        tokio::spawn(relay_stderr(self.name.clone(), stderr, self.stderr_lines.clone()));

        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.exit_watcher = Some(tokio::spawn(watch_exit(
            self.name.clone(),
            child,
            self.running.clone(),
            self.stop_requested.clone(),
            self.faults.clone(),
        )));
        self.pid = Some(pid);
        self.config_file = Some(config_path);

        info!(service = %self.name, "Process spawned with PID: {}", pid);
        Ok(ready_rx)
    }

    /// Requests termination and waits for the exit watcher to finish.
    ///
    /// `stop_requested` is raised before any signal is sent, so the watcher
    /// never mistakes this exit for a crash.
    async fn terminate(&mut self) -> Result<Option<ExitStatus>> {
        self.stop_requested.store(true, Ordering::SeqCst);

        let Some(mut watcher) = self.exit_watcher.take() else {
            return Ok(None);
        };

        if self.is_running() {
            if let Err(e) = self.send_signal_to_group(Signal::SIGTERM) {
                warn!(service = %self.name, "Failed to send SIGTERM: {}", e);
            }
        }

        let status = match timeout(self.config.graceful_shutdown_timeout, &mut watcher).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(service = %self.name, "Graceful shutdown timeout, forcing kill");
                if let Err(e) = self.send_signal_to_group(Signal::SIGKILL) {
                    warn!(service = %self.name, "Failed to send SIGKILL: {}", e);
                }
                watcher.await?
            }
        };

        self.pid = None;
        self.config_file = None;
        Ok(status)
    }

    fn send_signal_to_group(&self, signal: Signal) -> Result<()> {
        match self.pid {
            Some(pid) => {
                debug!(
                    service = %self.name,
                    "Sending signal {:?} to process group {}", signal, pid
                );
                killpg(pid, signal)?;
                Ok(())
            }
            None => Err(eyre!("No process to send signal to")),
        }
    }
}

#[async_trait]
impl ManagedService for ProcessService {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ServiceState {
        self.process_state().into()
    }

    async fn start(&mut self) -> Result<()> {
        let state = self.process_state();
        if !matches!(state, ProcessState::Idle | ProcessState::Terminated) {
            return Err(eyre!("{} is already started ({:?})", self.name, state));
        }
        if self.exit_watcher.is_some() {
            // Reap the previous run that exited on its own
            self.terminate().await?;
        }

        self.state = ProcessState::Launching;
        let ready = match self.spawn_process() {
            Ok(ready) => ready,
            Err(e) => {
                self.state = ProcessState::Terminated;
                return Err(e);
            }
        };

        match timeout(self.config.readiness_timeout, ready).await {
            Ok(Ok(())) => {
                self.state = ProcessState::Ready;
                info!(service = %self.name, "Repeater server is up");
                self.state = ProcessState::Active;
                Ok(())
            }
            Ok(Err(_)) => {
                // stdout closed without ever printing the marker
                let status = self.terminate().await?;
                self.state = ProcessState::Terminated;
                Err(ServiceError::LaunchFailed {
                    service: self.name.clone(),
                    code: status.and_then(|s| s.code()),
                }
                .into())
            }
            Err(_) => {
                warn!(
                    service = %self.name,
                    "No readiness marker within {:?}, terminating",
                    self.config.readiness_timeout
                );
                self.terminate().await?;
                self.state = ProcessState::Terminated;
                Err(ServiceError::LaunchTimeout {
                    service: self.name.clone(),
                    timeout: self.config.readiness_timeout,
                }
                .into())
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);

        if matches!(self.state, ProcessState::Idle | ProcessState::Terminated) {
            debug!(service = %self.name, "Not running, nothing to stop");
            return Ok(());
        }

        self.state = ProcessState::Stopping;
        info!(service = %self.name, "Initiating shutdown");
        let result = self.terminate().await;
        self.state = ProcessState::Terminated;

        let status = result?;
        info!(service = %self.name, "Process stopped with status: {:?}", status);
        Ok(())
    }
}

impl Drop for ProcessService {
    fn drop(&mut self) {
        // Emergency cleanup when the service is dropped without being stopped
        if self.is_running() {
            self.stop_requested.store(true, Ordering::SeqCst);
            if let Some(pid) = self.pid {
                match killpg(pid, Signal::SIGKILL) {
                    Ok(()) | Err(nix::Error::ESRCH) => {}
                    Err(e) => {
                        eprintln!("Failed to kill process group {} of {}: {}", pid, self.name, e)
                    }
                }
            }
        }
    }
}

/// Splits child output into lines without requiring UTF-8.
///
/// Invalid bytes become U+FFFD and only the trailing `\n` is stripped. Read
/// errors are logged and skipped until `MAX_READ_ERRORS` occur in a row.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    errors: usize,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            errors: 0,
        }
    }

    /// Next line, `None` at end of stream or once reads keep failing
    async fn next_line(&mut self, name: &str, stream: &str) -> Option<String> {
        loop {
            match self.read_line().await {
                Ok(line) => {
                    self.errors = 0;
                    return line;
                }
                Err(e) => {
                    warn!(service = %name, "Failed to read {}: {}", stream, e);
                    self.errors += 1;
                    if self.errors >= MAX_READ_ERRORS {
                        return None;
                    }
                }
            }
        }
    }

    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Scans stdout line by line and fires `ready` on the first marker line.
///
/// Keeps draining after readiness so the child never blocks on a full pipe.
async fn watch_stdout<R: AsyncRead + Unpin>(
    name: String,
    stdout: R,
    marker: String,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut lines = OutputLines::new(stdout);

    while let Some(line) = lines.next_line(&name, "stdout").await {
        debug!(service = %name, "stdout: {}", line);
        if line.contains(&marker) {
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }
        }
    }
}

/// Relays every stderr line, minus its newline, to the diagnostic log and to
/// any `subscribe_stderr` receivers
async fn relay_stderr<R: AsyncRead + Unpin>(
    name: String,
    stderr: R,
    relayed: broadcast::Sender<String>,
) {
    let mut lines = OutputLines::new(stderr);

    while let Some(line) = lines.next_line(&name, "stderr").await {
        warn!(service = %name, "stderr: {}", line);
        // No subscribers is the usual case
        let _ = relayed.send(line);
    }
}

async fn watch_exit(
    name: String,
    mut child: Child,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    faults: FaultReporter,
) -> Option<ExitStatus> {
    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            error!(service = %name, "Error waiting for process: {}", e);
            None
        }
    };
    running.store(false, Ordering::SeqCst);

    let code = status.and_then(|s| s.code());
    if stop_requested.load(Ordering::SeqCst) {
        info!(service = %name, "Process exited with status: {:?}", status);
    } else {
        error!(service = %name, "{} unexpectedly quit with code: {:?}", name, code);
        faults.report(UnexpectedTermination {
            service: name.clone(),
            code,
        });
    }

    status
}
