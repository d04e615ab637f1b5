//! Connectivity monitoring and restart escalation.
//!
//! ```text
//!   Healthy ──probe fails──▶ Degraded ──downtime ≥ timeout, enabled,──▶ RestartPending
//!      ▲                        │          cooldown elapsed                 │
//!      └──────probe ok──────────┘                               notify + restart
//!      ▲                                                                    ▼
//!      └───────────────────────────probe ok─────────────────────────── CoolingDown
//! ```
//!
//! Downtime is measured on the monotonic clock from the last successful
//! probe. A process that has never had a successful probe never escalates.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client as HttpClient;
use serde::Serialize;
use tokio::sync::watch;

use crate::report::{ErrorReporter, ReportTag};
use crate::schedule::sleep_or_shutdown;

/// Endpoints tried in order; any alive answer means "online".
pub const DEFAULT_PROBE_ENDPOINTS: &[&str] = &[
    "https://www.google.com",
    "https://1.1.1.1",
    "http://portal.cpcbocems.com",
];

/// Status codes that prove the endpoint was reached.
pub const ALIVE_STATUS_CODES: &[u16] = &[200, 301, 302, 303, 307, 308];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    RestartPending,
    CoolingDown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::RestartPending => write!(f, "restart pending"),
            Self::CoolingDown => write!(f, "cooling down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub auto_restart: bool,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(30 * 60),
            cooldown: Duration::from_secs(30 * 60),
            auto_restart: true,
        }
    }
}

/// What the caller must do after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Restart { downtime: Duration },
}

#[derive(Debug, Clone)]
pub struct MonitorState {
    pub state: HealthState,
    pub last_success_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_restart_at: Option<Instant>,
    pub restart_count: u32,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            last_success_at: None,
            consecutive_failures: 0,
            last_restart_at: None,
            restart_count: 0,
        }
    }
}

impl MonitorState {
    /// Feed one probe result observed at `now`.
    pub fn observe(&mut self, reachable: bool, now: Instant, policy: &MonitorPolicy) -> Action {
        if reachable {
            self.last_success_at = Some(now);
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
            return Action::None;
        }

        self.consecutive_failures += 1;
        let cooling = self
            .last_restart_at
            .is_some_and(|at| now.saturating_duration_since(at) < policy.cooldown);
        self.state = if cooling && self.state == HealthState::CoolingDown {
            HealthState::CoolingDown
        } else {
            HealthState::Degraded
        };

        let Some(last_ok) = self.last_success_at else {
            return Action::None;
        };
        let downtime = now.saturating_duration_since(last_ok);
        if downtime < policy.timeout {
            return Action::None;
        }
        if !policy.auto_restart {
            log::warn!(
                "offline for {}s, auto-restart disabled",
                downtime.as_secs()
            );
            return Action::None;
        }
        if cooling {
            log::warn!(
                "offline for {}s, restart cooldown still active",
                downtime.as_secs()
            );
            return Action::None;
        }

        self.state = HealthState::RestartPending;
        Action::Restart { downtime }
    }

    /// The restart for a pending escalation was issued at `now`.
    pub fn restart_issued(&mut self, now: Instant) {
        self.restart_count += 1;
        self.last_restart_at = Some(now);
        self.state = HealthState::CoolingDown;
    }
}

/// Serializable view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub seconds_since_success: Option<u64>,
    pub restart_count: u32,
    pub auto_restart: bool,
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    /// Endpoint that answered, if any.
    pub endpoint: Option<String>,
    pub detail: String,
}

pub trait Probe: Send + Sync {
    fn check(&self) -> impl Future<Output = ProbeResult> + Send;
}

pub trait Remediator: Send + Sync {
    fn restart(&self) -> impl Future<Output = Result<(), String>> + Send;
}

/// HTTP reachability probe over a list of endpoints.
pub struct HttpProbe {
    client: HttpClient,
    endpoints: Vec<String>,
}

impl HttpProbe {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        // Redirects are answers too; do not follow them.
        let client = HttpClient::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, endpoints }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_PROBE_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(10),
        )
    }
}

impl Probe for HttpProbe {
    async fn check(&self) -> ProbeResult {
        let mut failures = Vec::new();
        for url in &self.endpoints {
            match self.client.get(url).send().await {
                Ok(resp) if ALIVE_STATUS_CODES.contains(&resp.status().as_u16()) => {
                    return ProbeResult {
                        reachable: true,
                        endpoint: Some(url.clone()),
                        detail: format!("HTTP {}", resp.status().as_u16()),
                    };
                }
                Ok(resp) => failures.push(format!("{url}: HTTP {}", resp.status().as_u16())),
                Err(e) => failures.push(format!("{url}: {e}")),
            }
        }
        ProbeResult {
            reachable: false,
            endpoint: None,
            detail: if failures.is_empty() {
                "no probe endpoints configured".to_string()
            } else {
                failures.join("; ")
            },
        }
    }
}

/// Runs an OS command (by default `sudo reboot`).
pub struct CommandRemediator {
    program: String,
    args: Vec<String>,
}

impl CommandRemediator {
    pub fn new(command: &[String]) -> Self {
        let mut parts = command.iter().cloned();
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
        }
    }

    pub fn system_reboot() -> Self {
        Self::new(&["sudo".to_string(), "reboot".to_string()])
    }
}

impl Remediator for CommandRemediator {
    async fn restart(&self) -> Result<(), String> {
        if self.program.is_empty() {
            return Err("no restart command configured".to_string());
        }
        log::error!("executing restart command: {} {}", self.program, self.args.join(" "));
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            tokio::process::Command::new(&self.program)
                .args(&self.args)
                .status(),
        )
        .await;
        match status {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("restart command exited with {status}")),
            Ok(Err(e)) => Err(format!("restart command failed to start: {e}")),
            // The command may still take effect.
            Err(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct ConnectivityMonitor<P, R> {
    state: Mutex<MonitorState>,
    policy: MonitorPolicy,
    probe: P,
    remediator: R,
    reporter: Arc<ErrorReporter>,
}

impl<P: Probe, R: Remediator> ConnectivityMonitor<P, R> {
    pub fn new(policy: MonitorPolicy, probe: P, remediator: R, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            policy,
            probe,
            remediator,
            reporter,
        }
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.lock();
        MonitorSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            seconds_since_success: state.last_success_at.map(|t| t.elapsed().as_secs()),
            restart_count: state.restart_count,
            auto_restart: self.policy.auto_restart,
        }
    }

    /// Probe once and act on the result.
    pub async fn check_once(&self) -> Action {
        let result = self.probe.check().await;
        let now = Instant::now();
        let action = {
            let mut state = self.lock();
            let action = state.observe(result.reachable, now, &self.policy);
            if result.reachable {
                log::debug!("connectivity ok via {}", result.endpoint.as_deref().unwrap_or("?"));
            } else {
                log::warn!(
                    "connectivity check failed ({} consecutive): {}",
                    state.consecutive_failures,
                    result.detail
                );
            }
            action
        };

        if let Action::Restart { downtime } = action {
            let count = self.lock().restart_count + 1;
            self.reporter
                .report(
                    ReportTag::InternetTimeoutRestart,
                    &format!(
                        "No internet for {} minutes. Auto-restarting system (restart #{count}).",
                        downtime.as_secs() / 60
                    ),
                )
                .await;
            self.lock().restart_issued(Instant::now());
            if let Err(e) = self.remediator.restart().await {
                log::error!("restart failed: {e}");
            }
        }
        action
    }

    /// Probe every `policy.interval` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "connectivity monitor started (interval {}s, timeout {}s, cooldown {}s, auto-restart {})",
            self.policy.interval.as_secs(),
            self.policy.timeout.as_secs(),
            self.policy.cooldown.as_secs(),
            self.policy.auto_restart
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.check_once().await;
            if sleep_or_shutdown(self.policy.interval, &mut shutdown).await {
                break;
            }
        }
        log::info!("connectivity monitor stopped");
    }
}
