//! Resilience policy for the supervised process and the gateway
//!
//! Components never retry on their own. They report what happened through the
//! [`Watchdog`] trait and the watchdog decides:
//! - Unexpected process exits are restarted with capped exponential backoff
//!   and jitter, until too many restarts land inside the restart window
//! - Bursts of proxy failures while the process claims to be running trigger
//!   a hard restart
//! - Security events (denied callers) are logged, rate limited per address

use crate::config::WatchdogConfig;
use crate::process::{ProcessSupervisor, ServerState};
use crate::shutdown;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Sink for failure and security signals
pub trait Watchdog: Send + Sync {
    /// The supervised process exited with a code that warrants a retry
    fn process_failed(&self, exit_code: i32);

    /// A caller was refused by the admission gate
    fn security_event(&self, address: IpAddr, detail: &str);

    /// Forwarding to the backend failed
    fn proxy_failure(&self, detail: &str);
}

/// Events delivered to the watchdog task
#[derive(Debug, Clone)]
pub enum WatchdogEvent {
    ProcessFailed { exit_code: i32 },
    SecurityEvent { address: IpAddr, detail: String },
    ProxyFailure { detail: String },
}

/// Cloneable reporting side of the watchdog
#[derive(Clone)]
pub struct WatchdogHandle {
    tx: mpsc::UnboundedSender<WatchdogEvent>,
}

impl WatchdogHandle {
    fn send(&self, event: WatchdogEvent) {
        if self.tx.send(event).is_err() {
            debug!("Watchdog task is gone, dropping event");
        }
    }
}

impl Watchdog for WatchdogHandle {
    fn process_failed(&self, exit_code: i32) {
        self.send(WatchdogEvent::ProcessFailed { exit_code });
    }

    fn security_event(&self, address: IpAddr, detail: &str) {
        self.send(WatchdogEvent::SecurityEvent {
            address,
            detail: detail.to_string(),
        });
    }

    fn proxy_failure(&self, detail: &str) {
        self.send(WatchdogEvent::ProxyFailure {
            detail: detail.to_string(),
        });
    }
}

/// Create a connected handle and service pair
pub fn channel(config: WatchdogConfig) -> (WatchdogHandle, WatchdogService) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WatchdogHandle { tx }, WatchdogService { config, rx })
}

/// Restart backoff with a restart-window circuit breaker
#[derive(Debug)]
pub struct RestartPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_restarts: u32,
    window: Duration,
    history: VecDeque<Instant>,
    attempt: u32,
}

impl RestartPolicy {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            history: VecDeque::new(),
            attempt: 0,
        }
    }

    /// Upper bound of the delay for a 1-based attempt, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Register a failure and return how long to wait before restarting,
    /// or `None` when the restart budget for the window is spent
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        // A quiet window means the process had been healthy; start over
        if self.history.is_empty() {
            self.attempt = 0;
        }

        if self.history.len() as u32 >= self.max_restarts {
            return None;
        }

        self.attempt += 1;
        self.history.push_back(now);

        // Equal jitter: half fixed, half random
        let base = self.base_delay(self.attempt);
        let half = base / 2;
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        Some(half + half.mul_f64(jitter))
    }
}

/// Sliding-window counter of proxy failures
#[derive(Debug)]
pub struct ProxyFailureTracker {
    threshold: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl ProxyFailureTracker {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            threshold: config.proxy_failure_threshold,
            window: Duration::from_secs(config.proxy_failure_window_secs),
            failures: VecDeque::new(),
        }
    }

    /// Record a failure; returns true once the threshold is reached, which also
    /// resets the counter
    pub fn record(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        if self.threshold > 0 && self.failures.len() as u32 >= self.threshold {
            self.failures.clear();
            return true;
        }
        false
    }
}

/// Per-address limiter for security event logging.
///
/// Addresses quiet for two windows are forgotten, together with any
/// suppressed count they still carried.
#[derive(Debug)]
pub struct SecurityEventLimiter {
    window: Duration,
    seen: DashMap<IpAddr, (Instant, u64)>,
    last_sweep: Mutex<Instant>,
}

impl SecurityEventLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Number of addresses currently tracked
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    /// Returns `Some(suppressed)` when the event should be logged, carrying the
    /// number of events swallowed since the last one that was
    pub fn record(&self, address: IpAddr, now: Instant) -> Option<u64> {
        self.sweep(now);

        match self.seen.entry(address) {
            Entry::Vacant(vacant) => {
                vacant.insert((now, 0));
                Some(0)
            }
            Entry::Occupied(mut occupied) => {
                let (last_logged, suppressed) = *occupied.get();
                if now.duration_since(last_logged) >= self.window {
                    occupied.insert((now, 0));
                    Some(suppressed)
                } else {
                    occupied.get_mut().1 += 1;
                    None
                }
            }
        }
    }

    /// Drop stale addresses, at most once per window
    fn sweep(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if now.saturating_duration_since(*last_sweep) < self.window {
                return;
            }
            *last_sweep = now;
        }

        let horizon = self.window * 2;
        self.seen.retain(|address, (last_logged, suppressed)| {
            let keep = now.saturating_duration_since(*last_logged) < horizon;
            if !keep && *suppressed > 0 {
                debug!(%address, suppressed = *suppressed, "Forgetting quiet address");
            }
            keep
        });
    }
}

/// Task side of the watchdog, owning the policy state
pub struct WatchdogService {
    config: WatchdogConfig,
    rx: mpsc::UnboundedReceiver<WatchdogEvent>,
}

impl WatchdogService {
    /// Consume events until shutdown, acting on `supervisor`
    pub async fn run(mut self, supervisor: Arc<ProcessSupervisor>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut restarts = RestartPolicy::new(&self.config);
        let mut proxy_failures = ProxyFailureTracker::new(&self.config);
        let security = SecurityEventLimiter::new(Duration::from_secs(
            self.config.security_event_window_secs,
        ));

        info!(
            max_restarts = self.config.max_restarts,
            restart_window_secs = self.config.restart_window_secs,
            proxy_failure_threshold = self.config.proxy_failure_threshold,
            "Watchdog started"
        );

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        WatchdogEvent::ProcessFailed { exit_code } => {
                            match restarts.next_delay(Instant::now()) {
                                Some(delay) => {
                                    info!(exit_code, delay_ms = delay.as_millis() as u64, "Scheduling restart");
                                    spawn_delayed_restart(Arc::clone(&supervisor), delay, shutdown_rx.clone());
                                }
                                None => {
                                    error!(
                                        exit_code,
                                        max_restarts = self.config.max_restarts,
                                        "Restart budget exhausted, leaving server down until started manually"
                                    );
                                }
                            }
                        }
                        WatchdogEvent::ProxyFailure { detail } => {
                            debug!(detail, "Proxy failure reported");
                            if proxy_failures.record(Instant::now()) && supervisor.state() == ServerState::Running {
                                warn!("Backend keeps failing while marked running, forcing a hard restart");
                                let supervisor = Arc::clone(&supervisor);
                                tokio::spawn(async move {
                                    supervisor.hard_restart().await;
                                });
                            }
                        }
                        WatchdogEvent::SecurityEvent { address, detail } => {
                            if let Some(suppressed) = security.record(address, Instant::now()) {
                                warn!(%address, detail, suppressed, "Security event: access denied");
                            }
                        }
                    }
                }
                _ = shutdown::requested(&mut shutdown_rx) => {
                    debug!("Watchdog shutting down");
                    break;
                }
            }
        }
    }
}

fn spawn_delayed_restart(
    supervisor: Arc<ProcessSupervisor>,
    delay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown::requested(&mut shutdown_rx) => {
                debug!("Pending restart cancelled by shutdown");
                return;
            }
        }

        // An operator may have stopped or restarted the server meanwhile
        if supervisor.state() != ServerState::Retrying {
            debug!(state = ?supervisor.state(), "Skipping scheduled restart");
            return;
        }

        let state = supervisor.start().await;
        info!(?state, "Scheduled restart finished");
    });
}
