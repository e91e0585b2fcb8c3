use crate::config::{BackendConfig, PathsConfig, SupervisorConfig};
use crate::environment::{bin_dir, EnvironmentContract, EnvironmentError, EnvironmentInputs};
use crate::logs::{LogSink, LogStream};
use crate::runtime::RuntimeInstaller;
use crate::secrets::KeyProvider;
use crate::shutdown;
use crate::watchdog::Watchdog;
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exit code of a process terminated by SIGTERM (128 + 15)
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// How long the exit waiter gives the output drains to reach EOF
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the process to be reaped after SIGKILL
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not running; the initial state
    Stopped,
    /// Installing the runtime and launching
    Starting,
    /// Launched and a process id was observed
    Running,
    /// Exited unexpectedly; the watchdog decides when to start again
    Retrying,
    /// `stop()` in progress
    Stopping,
    /// Will not run without intervention (missing secret, mismatched runtime, launch failure)
    FatalError,
    /// Runtime bundle is absent and could not be installed
    MissingRuntime,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Retrying => "retrying",
            ServerState::Stopping => "stopping",
            ServerState::FatalError => "fatal_error",
            ServerState::MissingRuntime => "missing_runtime",
        }
    }
}

/// States from which `start()` may begin a launch
const STARTABLE: &[ServerState] = &[
    ServerState::Stopped,
    ServerState::Retrying,
    ServerState::FatalError,
    ServerState::MissingRuntime,
];

/// Map an exit code to the state the supervisor settles in
pub fn classify_exit(code: i32, mismatch_exit_code: i32) -> ServerState {
    if code == mismatch_exit_code {
        ServerState::FatalError
    } else if code == 0 || code == SIGTERM_EXIT_CODE {
        ServerState::Stopped
    } else {
        ServerState::Retrying
    }
}

/// Exit code with signal deaths mapped to `128 + signal`
fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Failed to wait for process");
            return -1;
        }
    };
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// The single live supervised process
struct ProcessHandle {
    pid: u32,
    generation: u64,
    /// Asks the exit waiter, which owns the `Child`, to SIGKILL it
    kill_tx: Option<oneshot::Sender<()>>,
    /// Exit code once the process has been reaped
    exited: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    async fn wait_exit(&mut self) -> Option<i32> {
        loop {
            if let Some(code) = *self.exited.borrow_and_update() {
                return Some(code);
            }
            if self.exited.changed().await.is_err() {
                return *self.exited.borrow();
            }
        }
    }
}

/// Point-in-time view for observers
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub runtime_installed: bool,
    /// Download progress while the runtime is being acquired
    pub install_progress: Option<f64>,
}

/// Owns the lifecycle of the supervised process.
///
/// `ProcessSupervisor` is used behind an `Arc`: [`new`](ProcessSupervisor::new)
/// returns `Arc<Self>`, and methods that spawn background tasks take
/// `self: &Arc<Self>`.
///
/// `start()` and `stop()` are serialized by one async lock. The exit waiter
/// does not take it; it only moves the state out of `Running`, so an exit seen
/// while `stop()` runs is left to `stop()`.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    backend: BackendConfig,
    data_dir: PathBuf,
    key_provider: Arc<dyn KeyProvider>,
    watchdog: Arc<dyn Watchdog>,
    installer: Arc<RuntimeInstaller>,
    log: Arc<LogSink>,
    state_tx: watch::Sender<ServerState>,
    handle: Mutex<Option<ProcessHandle>>,
    generation: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    restart_in_flight: tokio::sync::Mutex<()>,
    install_progress: Mutex<Option<f64>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        backend: BackendConfig,
        paths: &PathsConfig,
        key_provider: Arc<dyn KeyProvider>,
        watchdog: Arc<dyn Watchdog>,
        installer: Arc<RuntimeInstaller>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        let data_dir = paths.data_dir();
        let log_path = data_dir.join("logs").join(&config.log_file);
        let log = LogSink::open(&log_path, config.log_max_bytes)?;
        let (state_tx, _) = watch::channel(ServerState::Stopped);

        Ok(Arc::new(Self {
            config,
            backend,
            data_dir,
            key_provider,
            watchdog,
            installer,
            log: Arc::new(log),
            state_tx,
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
            restart_in_flight: tokio::sync::Mutex::new(()),
            install_progress: Mutex::new(None),
            shutdown_rx,
        }))
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().map(|h| h.pid)
    }

    /// True while a launched process has not yet been reaped
    pub fn is_alive(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.has_exited())
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state(),
            pid: self.pid(),
            runtime_installed: self.installer.is_installed(),
            install_progress: *self.install_progress.lock(),
        }
    }

    /// Last `lines` lines of the process log
    pub fn log_tail(&self, lines: usize) -> Vec<String> {
        self.log.tail(lines).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read process log");
            Vec::new()
        })
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    fn pid_file(&self) -> PathBuf {
        self.data_dir.join(&self.config.pid_file)
    }

    /// Move to `to` only if the current state is one of `from`
    fn transition(&self, to: ServerState, from: &[ServerState]) -> bool {
        let mut previous = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            debug!(from = previous.as_str(), to = to.as_str(), "Server state changed");
        }
        changed
    }

    /// Install the runtime if its entry point is missing
    pub async fn ensure_runtime_installed(&self) -> bool {
        if self.installer.is_installed() {
            return true;
        }

        info!(path = %self.installer.runtime_dir().display(), "Runtime not installed, acquiring");
        self.log.note("runtime missing, downloading");

        let slot = &self.install_progress;
        let progress = |fraction: f64| {
            *slot.lock() = Some(fraction);
        };
        let mut cancel = self.shutdown_rx.clone();
        let installed = self.installer.install_latest(&progress, &mut cancel).await;
        *self.install_progress.lock() = None;

        installed && self.installer.is_installed()
    }

    /// Start the process. Returns the state the call settled in.
    pub async fn start(self: &Arc<Self>) -> ServerState {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.transition(ServerState::Starting, STARTABLE) {
            let state = self.state();
            debug!(state = state.as_str(), "Start ignored");
            return state;
        }

        if !self.ensure_runtime_installed().await {
            error!("Runtime unavailable, server cannot start");
            self.log.note("runtime unavailable");
            self.transition(ServerState::MissingRuntime, &[ServerState::Starting]);
            return self.state();
        }

        match self.launch() {
            Ok(pid) => {
                info!(pid, port = self.backend.port, "Server process running");
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to launch server process");
                self.log.note(&format!("launch failed: {:#}", e));
                self.transition(ServerState::FatalError, &[ServerState::Starting]);
            }
        }
        self.state()
    }

    fn launch(self: &Arc<Self>) -> anyhow::Result<u32> {
        let runtime_dir = self.installer.runtime_dir();
        let inputs = EnvironmentInputs {
            runtime_root: runtime_dir,
            data_root: &self.data_dir,
            host: self.backend.host,
            port: self.backend.port,
            memory_limit_mb: self.config.memory_limit_mb,
            inherited_path: std::env::var_os("PATH"),
        };
        let environment = EnvironmentContract::build(&inputs, self.key_provider.get_or_create_secret())
            .map_err(|e: EnvironmentError| anyhow::anyhow!("refusing to launch: {}", e))?;

        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))?;

        let mut cmd = self.command(runtime_dir);
        environment.apply(&mut cmd);
        cmd.current_dir(&self.data_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Leads its own group so signals reach everything the server spawns
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().context("Failed to spawn server process")?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("process exited before its pid was observed"))?;

        let drains = vec![
            spawn_drain(child.stdout.take(), LogStream::Stdout, Arc::clone(&self.log), self.shutdown_rx.clone()),
            spawn_drain(child.stderr.take(), LogStream::Stderr, Arc::clone(&self.log), self.shutdown_rx.clone()),
        ];

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        {
            let mut slot = self.handle.lock();
            if let Err(e) = std::fs::write(self.pid_file(), format!("{}\n", pid)) {
                warn!(path = %self.pid_file().display(), error = %e, "Failed to write pid file");
            }
            *slot = Some(ProcessHandle {
                pid,
                generation,
                kill_tx: Some(kill_tx),
                exited: exit_rx,
            });
            self.transition(ServerState::Running, &[ServerState::Starting]);
        }
        self.log.note(&format!("started pid {}", pid));

        // Spawned after Running is published so an instant exit is still classified
        self.spawn_exit_waiter(child, pid, generation, kill_rx, exit_tx, drains);
        Ok(pid)
    }

    /// Prefer the bundled bootstrap script, else the interpreter with start args
    fn command(&self, runtime_dir: &Path) -> Command {
        let bin = bin_dir(runtime_dir);
        let script = bin.join(&self.config.bootstrap_script);

        if !self.config.bootstrap_script.is_empty() && script.is_file() {
            info!(script = %script.display(), "Launching via bootstrap script");
            let mut cmd = Command::new("sh");
            cmd.arg(script);
            cmd
        } else {
            let entry = bin.join(&self.config.entry_executable);
            info!(entry = %entry.display(), args = ?self.config.start_args, "Launching interpreter");
            let mut cmd = Command::new(entry);
            cmd.args(self.config.start_args.iter().map(|arg| resolve_arg(runtime_dir, arg)));
            cmd
        }
    }

    fn spawn_exit_waiter(
        self: &Arc<Self>,
        mut child: Child,
        pid: u32,
        generation: u64,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<i32>>,
        drains: Vec<JoinHandle<()>>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    #[cfg(unix)]
                    signal_group(pid, libc::SIGKILL);
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to kill server process");
                    }
                    child.wait().await
                }
            };
            let code = exit_code(status);

            // Leftover group members would hold the port and the output pipes
            #[cfg(unix)]
            if signal_group(pid, libc::SIGKILL) {
                debug!(pid, "Killed processes left behind in the server's group");
            }

            exit_tx.send_replace(Some(code));

            for drain in drains {
                if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, drain).await.is_err() {
                    debug!("Output drain still open after exit, detaching");
                }
            }

            supervisor.on_exit(generation, code);
        });
    }

    fn on_exit(&self, generation: u64, code: i32) {
        let next = classify_exit(code, self.config.mismatch_exit_code);

        {
            let mut slot = self.handle.lock();
            if slot.as_ref().map(|h| h.generation) != Some(generation) {
                debug!(code, "Exit of a superseded process");
                return;
            }
            if !self.transition(next, &[ServerState::Running]) {
                // stop() owns this exit
                debug!(code, state = self.state().as_str(), "Exit observed during stop");
                return;
            }
            *slot = None;
            let _ = std::fs::remove_file(self.pid_file());
        }
        self.log.note(&format!("exited with code {}", code));

        match next {
            ServerState::Stopped => info!(code, "Server process exited"),
            ServerState::FatalError => error!(
                code,
                "Server process reported an incompatible runtime, not restarting"
            ),
            _ => {
                warn!(code, "Server process exited unexpectedly");
                self.watchdog.process_failed(code);
            }
        }
    }

    /// Stop the process: SIGTERM, wait out the grace period, then SIGKILL.
    /// Always ends in `Stopped`.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        self.state_tx.send_replace(ServerState::Stopping);
        let handle = self.handle.lock().take();

        if let Some(mut handle) = handle {
            self.terminate(&mut handle).await;
        }

        let _ = std::fs::remove_file(self.pid_file());
        self.state_tx.send_replace(ServerState::Stopped);
        self.log.note("stopped");
        info!("Server stopped");
    }

    async fn terminate(&self, handle: &mut ProcessHandle) {
        if handle.has_exited() {
            debug!(pid = handle.pid, "Process already exited");
            return;
        }

        let pid = handle.pid;
        let grace_period = self.config.shutdown_grace_period();
        info!(pid, "Sending SIGTERM to server process");

        #[cfg(unix)]
        if !signal_group(pid, libc::SIGTERM) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }

        match tokio::time::timeout(grace_period, handle.wait_exit()).await {
            Ok(code) => {
                info!(pid, ?code, "Server process exited gracefully");
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Some(kill_tx) = handle.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                if tokio::time::timeout(KILL_WAIT_TIMEOUT, handle.wait_exit()).await.is_err() {
                    error!(pid, "Server process did not exit after SIGKILL");
                }
            }
        }
    }

    /// `stop()`, settle, `start()`. A call made while another restart is in
    /// flight returns immediately.
    pub async fn hard_restart(self: &Arc<Self>) -> ServerState {
        let Ok(_restart) = self.restart_in_flight.try_lock() else {
            debug!("Restart already in flight");
            return self.state();
        };

        info!("Hard restart");
        self.stop().await;
        tokio::time::sleep(self.config.restart_settle()).await;
        self.start().await
    }
}

/// Send `signal` to the process group led by `pid`. False when no such group exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

/// Resolve a start argument against the runtime root when it names a bundled file
fn resolve_arg(runtime_dir: &Path, arg: &str) -> OsString {
    if !arg.starts_with('-') {
        let candidate = runtime_dir.join(arg);
        if candidate.exists() {
            return candidate.into_os_string();
        }
    }
    OsString::from(arg)
}

/// Copy one output stream line by line into the log file and tracing
fn spawn_drain<R>(
    reader: Option<R>,
    stream: LogStream,
    log: Arc<LogSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read,
                _ = shutdown::requested(&mut shutdown_rx) => break,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\r', '\n'][..]);
                    log.append(stream, line);
                    info!(target: "flowgate::backend", stream = stream.as_str(), "{}", line);
                }
                Err(e) => {
                    warn!(stream = stream.as_str(), error = %e, "Output drain failed");
                    break;
                }
            }
        }
    })
}
