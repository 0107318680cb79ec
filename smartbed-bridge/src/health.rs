//! Health monitor: failure accounting, restart escalation, proxy reboot
//! dispatch with cooldown, heartbeat telemetry, and the degraded flag.
//!
//! Transient BLE trouble must never flip the availability topic, because
//! consumers drop entities when it goes offline. Degradation is reported on its own
//! retained topic and in the heartbeat instead, and the monitor is the only
//! component allowed to ask the supervisor for a reconnect cycle.

use crate::bus::BusHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const PROXY_REBOOT_COOLDOWN: Duration = Duration::from_secs(10 * 60);
pub const MAINTENANCE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MAINTENANCE_MIN_UPTIME: Duration = Duration::from_secs(30 * 60);
pub const MAINTENANCE_IDLE_THRESHOLD: Duration = Duration::from_secs(12 * 60 * 60);
const FAILURE_ESCALATION_THRESHOLD: u32 = 3;
const ERROR_SNIPPET_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub kind: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorSnapshot {
    device: String,
    message: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandSnapshot {
    device: String,
    command: Option<String>,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct HealthState {
    last_ble_success_at: Option<DateTime<Utc>>,
    consecutive_ble_failures: u32,
    last_ble_error: Option<ErrorSnapshot>,
    last_command: Option<CommandSnapshot>,
    last_command_instant: Option<Instant>,
    proxy_statuses: HashMap<String, serde_json::Value>,
    degraded_published: Option<bool>,
}

struct HealthInner {
    bus: BusHandle,
    service_type: String,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    state: Mutex<HealthState>,
    reboot_cooldowns: Mutex<HashMap<String, Instant>>,
    restart_tx: watch::Sender<Option<RestartRequest>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<HealthInner>,
}

impl HealthMonitor {
    /// Creates the monitor and spawns its heartbeat, maintenance, and proxy
    /// status ingestion tasks.
    pub fn new(bus: BusHandle, service_type: &str, proxy_hosts: &[String]) -> Self {
        let (restart_tx, _) = watch::channel(None);
        let monitor = Self {
            inner: Arc::new(HealthInner {
                bus,
                service_type: service_type.to_string(),
                started_at: Utc::now(),
                start_instant: Instant::now(),
                state: Mutex::new(HealthState::default()),
                reboot_cooldowns: Mutex::new(HashMap::new()),
                restart_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        monitor.publish_degraded();
        monitor.spawn_heartbeat();
        monitor.spawn_maintenance();
        for host in proxy_hosts {
            monitor.spawn_proxy_status_ingest(host);
        }
        monitor
    }

    pub fn record_ble_success(&self, device: &str) {
        let mut state = self.inner.state.lock();
        state.last_ble_success_at = Some(Utc::now());
        state.consecutive_ble_failures = 0;
        drop(state);
        tracing::debug!(device, "ble success recorded");
        self.publish_degraded();
    }

    /// Failure accounting with multi-tier escalation: the third consecutive
    /// retryable failure dispatches a proxy reboot (when the host is known)
    /// and requests a full restart to drop the stale API session.
    pub fn record_ble_failure(
        &self,
        device: &str,
        error: &str,
        proxy_host: Option<&str>,
        retryable: bool,
    ) {
        let escalate;
        {
            let mut state = self.inner.state.lock();
            state.last_ble_error = Some(ErrorSnapshot {
                device: device.to_string(),
                message: truncate(error, ERROR_SNIPPET_LIMIT),
                at: Utc::now(),
            });
            if retryable {
                state.consecutive_ble_failures += 1;
                escalate = state.consecutive_ble_failures >= FAILURE_ESCALATION_THRESHOLD;
                if escalate {
                    state.consecutive_ble_failures = 0;
                }
            } else {
                state.consecutive_ble_failures = 0;
                escalate = false;
            }
        }
        warn!(device, error, retryable, "ble failure recorded");

        if escalate {
            if let Some(host) = proxy_host {
                self.request_proxy_reboot(host);
            }
            self.request_restart(
                "ble-failures",
                &format!("three consecutive retryable BLE failures, last on {device}: {error}"),
            );
        }
        self.publish_degraded();
    }

    pub fn record_command(&self, device: &str, command: Option<&str>) {
        let mut state = self.inner.state.lock();
        state.last_command = Some(CommandSnapshot {
            device: device.to_string(),
            command: command.map(str::to_string),
            at: Utc::now(),
        });
        state.last_command_instant = Some(Instant::now());
    }

    /// First accepted request wins; later ones are ignored until the
    /// supervisor cycles.
    pub fn request_restart(&self, kind: &str, reason: &str) {
        let request = RestartRequest {
            kind: kind.to_string(),
            reason: reason.to_string(),
            requested_at: Utc::now(),
        };
        let accepted = self.inner.restart_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(request.clone());
                true
            } else {
                false
            }
        });
        if accepted {
            info!(kind, reason, "restart requested");
            self.publish_degraded();
        }
    }

    /// Publishes `REBOOT` to the proxy's command topic, at most once per
    /// cooldown window per host. Suppressed requests leave an audit
    /// breadcrumb with the remaining cooldown.
    pub fn request_proxy_reboot(&self, host: &str) {
        let now = Instant::now();
        // test-and-set under one lock so concurrent callers cannot both win
        let suppressed_for = {
            let mut cooldowns = self.inner.reboot_cooldowns.lock();
            match cooldowns.get(host) {
                Some(until) if *until > now => Some(until.saturating_duration_since(now).as_secs()),
                _ => {
                    cooldowns.insert(host.to_string(), now + PROXY_REBOOT_COOLDOWN);
                    None
                }
            }
        };
        if let Some(remaining) = suppressed_for {
            warn!(host, remaining_sec = remaining, "proxy reboot suppressed by cooldown");
            self.inner.bus.publish_json(
                self.inner.bus.topic(&format!("proxy/{host}/reboot_suppressed")),
                &json!({
                    "host": host,
                    "cooldownRemainingSec": remaining,
                    "at": Utc::now(),
                }),
                false,
            );
        } else {
            warn!(host, "requesting proxy reboot");
            self.inner.bus.publish(
                self.inner.bus.topic(&format!("proxy/{host}/command")),
                "REBOOT",
                false,
            );
            self.inner.bus.publish_json(
                self.inner.bus.topic(&format!("proxy/{host}/reboot_requested")),
                &json!({
                    "host": host,
                    "requestId": Uuid::new_v4().to_string(),
                    "at": Utc::now(),
                }),
                false,
            );
        }
    }

    /// Remaining reboot cooldown for a host, if any.
    pub fn reboot_cooldown_remaining(&self, host: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .reboot_cooldowns
            .lock()
            .get(host)
            .map(|until| until.saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// One-shot awaitable resolving on the first accepted restart request.
    pub async fn wait_for_restart(&self) -> RestartRequest {
        let mut rx = self.inner.restart_tx.subscribe();
        loop {
            if let Some(request) = rx.borrow().clone() {
                return request;
            }
            if rx.changed().await.is_err() {
                // sender lives as long as the monitor; never reached
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn pending_restart(&self) -> Option<RestartRequest> {
        self.inner.restart_tx.borrow().clone()
    }

    /// Per-device snapshot published under `<ns>/health/<deviceId>`.
    pub fn publish_device_snapshot<T: Serialize>(&self, device_id: &str, snapshot: &T) {
        self.inner.bus.publish_json(
            self.inner.bus.topic(&format!("health/{device_id}")),
            snapshot,
            false,
        );
    }

    fn degraded(&self) -> bool {
        self.inner.state.lock().consecutive_ble_failures > 0 || self.pending_restart().is_some()
    }

    /// Retained degraded flag, published on change only.
    fn publish_degraded(&self) {
        let degraded = self.degraded();
        let mut state = self.inner.state.lock();
        if state.degraded_published == Some(degraded) {
            return;
        }
        state.degraded_published = Some(degraded);
        drop(state);
        self.inner.bus.publish(
            self.inner.bus.topic("status/degraded"),
            if degraded { "true" } else { "false" },
            true,
        );
    }

    pub fn heartbeat_payload(&self) -> serde_json::Value {
        let pending = self.pending_restart();
        let state = self.inner.state.lock();
        json!({
            "type": self.inner.service_type,
            "startedAt": self.inner.started_at,
            "uptimeSec": self.inner.start_instant.elapsed().as_secs(),
            "memoryMb": memory_usage_mb(),
            "lastBleSuccessAt": state.last_ble_success_at,
            "consecutiveBleFailures": state.consecutive_ble_failures,
            "lastBleError": state.last_ble_error.clone(),
            "lastCommand": state.last_command.clone(),
            "proxies": state.proxy_statuses.clone(),
            "degraded": state.consecutive_ble_failures > 0 || pending.is_some(),
            "pendingRestart": pending,
        })
    }

    pub fn publish_heartbeat(&self) {
        let payload = self.heartbeat_payload();
        self.inner
            .bus
            .publish_json(self.inner.bus.topic("health"), &payload, false);
    }

    /// Final snapshot before a coded exit.
    pub fn publish_final_snapshot(&self) {
        self.publish_heartbeat();
    }

    /// Stops the background tasks; the supervisor calls this before it
    /// tears the bus down so stale monitors cannot keep publishing.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_heartbeat(&self) {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                monitor.publish_heartbeat();
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Long-idle installations quietly rot (stale sockets, wedged proxy
    /// subscriptions); a periodic check forces a reconnect cycle.
    fn spawn_maintenance(&self) {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                let uptime = monitor.inner.start_instant.elapsed();
                let idle = {
                    let state = monitor.inner.state.lock();
                    state
                        .last_command_instant
                        .unwrap_or(monitor.inner.start_instant)
                        .elapsed()
                };
                if maintenance_due(uptime, idle) {
                    monitor.request_restart(
                        "maintenance",
                        &format!(
                            "no commands for {} h, cycling connections",
                            idle.as_secs() / 3600
                        ),
                    );
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    fn spawn_proxy_status_ingest(&self, host: &str) {
        let monitor = self.clone();
        let host = host.to_string();
        let mut rx = self
            .inner
            .bus
            .subscribe(&self.inner.bus.topic(&format!("proxy/{host}/status")));
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                // best-effort parse; a garbled self-report is still worth keeping
                let value = serde_json::from_slice(&msg.payload)
                    .unwrap_or_else(|_| json!(msg.payload_str()));
                monitor
                    .inner
                    .state
                    .lock()
                    .proxy_statuses
                    .insert(host.clone(), value);
            }
        });
        self.inner.tasks.lock().push(task);
    }
}

pub fn maintenance_due(uptime: Duration, idle: Duration) -> bool {
    uptime >= MAINTENANCE_MIN_UPTIME && idle >= MAINTENANCE_IDLE_THRESHOLD
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text[..cut].to_string()
    }
}

#[cfg(target_os = "linux")]
fn memory_usage_mb() -> Option<f32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                return Some(kb as f32 / 1024.0);
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn memory_usage_mb() -> Option<f32> {
    None
}
