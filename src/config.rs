use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener and admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Loopback endpoint the supervised process binds to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Filesystem roots
    #[serde(default)]
    pub paths: PathsConfig,

    /// Process lifecycle settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Where the runtime bundle is downloaded from
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Restart and alerting policy
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy listen port
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the loopback admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle pooled connections to the backend
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Optional per-request timeout in seconds (unset means no timeout)
    pub request_timeout_secs: Option<u64>,
}

impl ServerConfig {
    pub fn proxy_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.admin_port)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: None,
        }
    }
}

/// The fixed loopback endpoint shared by the supervisor and the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: Ipv4Addr,

    #[serde(default = "default_backend_port")]
    pub port: u16,
}

impl BackendConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.host), self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    /// Installed runtime bundle (bin/, lib/)
    pub runtime_dir: Option<PathBuf>,

    /// User data root for the supervised process, logs and the access store
    pub data_dir: Option<PathBuf>,
}

impl PathsConfig {
    fn base_dir() -> PathBuf {
        dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flowgate")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("runtime"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("data"))
    }

    pub fn access_db(&self) -> PathBuf {
        self.data_dir().join("access.db")
    }

    pub fn secret_file(&self) -> PathBuf {
        self.data_dir().join("secret.key")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Interpreter executable under `<runtime>/bin`, also the installed-check marker
    #[serde(default = "default_entry_executable")]
    pub entry_executable: String,

    /// Optional bootstrap script under `<runtime>/bin`, preferred when present
    #[serde(default = "default_bootstrap_script")]
    pub bootstrap_script: String,

    /// Arguments passed to the interpreter when no bootstrap script exists.
    /// Relative paths are resolved against the runtime root
    #[serde(default = "default_start_args")]
    pub start_args: Vec<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Pause between stop and start during a hard restart, in milliseconds
    #[serde(default = "default_restart_settle")]
    pub restart_settle_ms: u64,

    /// Heap ceiling handed to the interpreter
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u32,

    /// Exit code that signals an incompatible installed runtime
    #[serde(default = "default_mismatch_exit_code")]
    pub mismatch_exit_code: i32,

    /// Log file name under `<data>/logs`
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Size at which the log file is rolled over
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,

    /// PID marker file name under `<data>`
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

impl SupervisorConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            entry_executable: default_entry_executable(),
            bootstrap_script: default_bootstrap_script(),
            start_args: default_start_args(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            restart_settle_ms: default_restart_settle(),
            memory_limit_mb: default_memory_limit(),
            mismatch_exit_code: default_mismatch_exit_code(),
            log_file: default_log_file(),
            log_max_bytes: default_log_max_bytes(),
            pid_file: default_pid_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Release index listing downloadable assets
    #[serde(default = "default_release_index_url")]
    pub release_index_url: String,

    /// Name of the archive asset in the release index
    #[serde(default = "default_artifact_asset")]
    pub artifact_asset: String,

    /// Name of the descriptor asset in the release index
    #[serde(default = "default_descriptor_asset")]
    pub descriptor_asset: String,

    /// Directory for in-progress downloads (default: `<data>/staging`)
    pub staging_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            release_index_url: default_release_index_url(),
            artifact_asset: default_artifact_asset(),
            descriptor_asset: default_descriptor_asset(),
            staging_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    /// First restart delay in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Upper bound on restart delay in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Restarts allowed inside `restart_window_secs` before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Proxy failures inside `proxy_failure_window_secs` that trigger a hard restart
    #[serde(default = "default_proxy_failure_threshold")]
    pub proxy_failure_threshold: u32,

    #[serde(default = "default_proxy_failure_window")]
    pub proxy_failure_window_secs: u64,

    /// Security events from one address are logged at most once per window
    #[serde(default = "default_security_event_window")]
    pub security_event_window_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            proxy_failure_threshold: default_proxy_failure_threshold(),
            proxy_failure_window_secs: default_proxy_failure_window(),
            security_event_window_secs: default_security_event_window(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9080
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_backend_host() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_backend_port() -> u16 {
    5678
}

fn default_entry_executable() -> String {
    "node".to_string()
}

fn default_bootstrap_script() -> String {
    "start.sh".to_string()
}

fn default_start_args() -> Vec<String> {
    vec![
        "lib/node_modules/n8n/bin/n8n".to_string(),
        "start".to_string(),
    ]
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_restart_settle() -> u64 {
    500
}

fn default_memory_limit() -> u32 {
    512
}

fn default_mismatch_exit_code() -> i32 {
    101
}

fn default_log_file() -> String {
    "server.log".to_string()
}

fn default_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_pid_file() -> String {
    "server.pid".to_string()
}

fn default_release_index_url() -> String {
    "https://api.github.com/repos/flowgate/runtime/releases/latest".to_string()
}

fn default_artifact_asset() -> String {
    "runtime.tar.gz".to_string()
}

fn default_descriptor_asset() -> String {
    "runtime.json".to_string()
}

fn default_backoff_initial() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    600
}

fn default_proxy_failure_threshold() -> u32 {
    10
}

fn default_proxy_failure_window() -> u64 {
    60
}

fn default_security_event_window() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backend.port == 0 {
            errors.push("backend.port must be greater than 0".to_string());
        }
        if !self.backend.host.is_loopback() {
            errors.push(format!(
                "backend.host must be a loopback address, got {}",
                self.backend.host
            ));
        }
        if self.server.port == self.server.admin_port {
            errors.push("server.port and server.admin_port must differ".to_string());
        }
        if self.backend.port == self.server.port || self.backend.port == self.server.admin_port {
            errors.push(format!(
                "backend.port {} clashes with a gateway listener port",
                self.backend.port
            ));
        }
        if self.supervisor.entry_executable.is_empty() {
            errors.push("supervisor.entry_executable must not be empty".to_string());
        }
        if self.watchdog.backoff_multiplier < 1.0 {
            errors.push("watchdog.backoff_multiplier must be at least 1.0".to_string());
        }
        if let Err(e) = self.server.proxy_addr() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
