//! Per-(proxy, device) BLE session.
//!
//! Scan and retry loops create transient session instances freely; all of
//! them funnel through the registry's per-DeviceKey connect mutex so the
//! proxy never sees overlapping connect requests (those come back as
//! "Connection request ignored" / GATT_BUSY spirals). Connect responses the
//! proxy emits on its own only update the connected flag here; they never
//! trigger a reconnect.

use crate::errors::BridgeError;
use crate::models::{mac_colon, AddressType, DeviceKey, GattService};
use crate::prefs::ConnectPrefs;
use crate::proxy::{ConnectOutcome, ProxyLink};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(12);
pub const SLOW_CONNECT_THRESHOLD: Duration = Duration::from_secs(8);
pub const FORCE_WITHOUT_CACHE_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const HARD_FAILURE_COOLDOWN: Duration = Duration::from_secs(3);
pub const MTU_ZERO_COOLDOWN: Duration = Duration::from_secs(2);
const CLEANUP_PAUSE: Duration = Duration::from_millis(250);
const EMPTY_SERVICES_RETRY_PAUSE: Duration = Duration::from_millis(400);
const RECOVERY_SETTLE_PAUSE: Duration = Duration::from_millis(600);

/// Per-attempt observations surfaced to external diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub device_key: String,
    pub proxy_host: String,
    pub mac: String,
    pub address_type: Option<AddressType>,
    pub used_without_cache: bool,
    pub mtu: Option<u16>,
    pub error_code: u16,
    pub ignored_connects: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub force_without_cache_until: Option<DateTime<Utc>>,
    pub connect_duration_ms: Option<u64>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_disconnect_reason: Option<String>,
}

/// Process-wide session bookkeeping: the connect mutexes, cooldowns, the
/// force-without-cache flags, and the live session per DeviceKey.
pub struct SessionRegistry {
    prefs: Arc<ConnectPrefs>,
    sessions: Mutex<HashMap<DeviceKey, Arc<DeviceSession>>>,
    connect_locks: Mutex<HashMap<DeviceKey, Arc<tokio::sync::Mutex<()>>>>,
    cooldowns: Mutex<HashMap<DeviceKey, Instant>>,
    force_without_cache: Mutex<HashMap<DeviceKey, Instant>>,
}

impl SessionRegistry {
    pub fn new(prefs: Arc<ConnectPrefs>) -> Arc<Self> {
        Arc::new(Self {
            prefs,
            sessions: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            force_without_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn prefs(&self) -> &ConnectPrefs {
        &self.prefs
    }

    /// Builds a session for (link, address), cleaning up any prior instance
    /// registered under the same key first.
    pub async fn session(
        self: &Arc<Self>,
        link: &Arc<ProxyLink>,
        address: u64,
        address_type: AddressType,
    ) -> Arc<DeviceSession> {
        let key = link.device_key(address);
        let prior = self.sessions.lock().remove(&key);
        if let Some(prior) = prior {
            prior.cleanup().await;
        }
        let session = DeviceSession::new(self.clone(), link.clone(), address, address_type);
        self.sessions.lock().insert(key, session.clone());
        session
    }

    /// Snapshot of every live session's diagnostics.
    pub fn diagnostics(&self) -> Vec<SessionDiagnostics> {
        self.sessions
            .lock()
            .values()
            .map(|s| s.diagnostics())
            .collect()
    }

    fn connect_lock(&self, key: &DeviceKey) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cooldown_until(&self, key: &DeviceKey) -> Option<Instant> {
        self.cooldowns
            .lock()
            .get(key)
            .copied()
            .filter(|until| *until > Instant::now())
    }

    fn set_cooldown(&self, key: &DeviceKey, duration: Duration) {
        self.cooldowns
            .lock()
            .insert(key.clone(), Instant::now() + duration);
    }

    fn clear_cooldown(&self, key: &DeviceKey) {
        self.cooldowns.lock().remove(key);
    }

    fn force_without_cache_active(&self, key: &DeviceKey) -> bool {
        self.force_without_cache
            .lock()
            .get(key)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    fn set_force_without_cache(&self, key: &DeviceKey) {
        self.force_without_cache
            .lock()
            .insert(key.clone(), Instant::now() + FORCE_WITHOUT_CACHE_WINDOW);
    }

    fn remove_if_current(&self, key: &DeviceKey, session: &DeviceSession) {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(key) {
            if std::ptr::eq(current.as_ref(), session) {
                sessions.remove(key);
            }
        }
    }
}

pub struct DeviceSession {
    key: DeviceKey,
    registry: Arc<SessionRegistry>,
    link: Arc<ProxyLink>,
    address: u64,
    address_type: AddressType,
    connected: AtomicBool,
    services: Mutex<Option<Vec<GattService>>>,
    notify_handles: Mutex<HashSet<u16>>,
    diag: Arc<Mutex<SessionDiagnostics>>,
    watch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeviceSession {
    fn new(
        registry: Arc<SessionRegistry>,
        link: Arc<ProxyLink>,
        address: u64,
        address_type: AddressType,
    ) -> Arc<Self> {
        let key = link.device_key(address);
        let diag = Arc::new(Mutex::new(SessionDiagnostics {
            device_key: key.to_string(),
            proxy_host: key.proxy_host.clone(),
            mac: key.mac_hex(),
            address_type: Some(address_type),
            ..Default::default()
        }));
        let session = Arc::new(Self {
            key,
            registry,
            link,
            address,
            address_type,
            connected: AtomicBool::new(false),
            services: Mutex::new(None),
            notify_handles: Mutex::new(HashSet::new()),
            diag,
            watch_task: Mutex::new(None),
        });
        session.spawn_event_watch();
        session
    }

    /// Watches async connection events for this address. These only update
    /// the connected flag and clear the services cache; auto-reconnecting
    /// off them is exactly the GATT_BUSY spiral this module exists to avoid.
    fn spawn_event_watch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut events = self.link.subscribe_conn_events();
        let address = self.address;
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    // dropped events are tolerable; only closure ends the watch
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if event.address != address {
                    continue;
                }
                let Some(session) = weak.upgrade() else { break };
                session.connected.store(event.connected, Ordering::SeqCst);
                if !event.connected {
                    *session.services.lock() = None;
                    let mut diag = session.diag.lock();
                    diag.last_disconnect_reason =
                        Some(format!("proxy reported disconnect, error {}", event.error));
                    debug!(device = %session.key, error = event.error, "device disconnected");
                }
            }
        });
        *self.watch_task.lock() = Some(task);
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn proxy_host(&self) -> &str {
        &self.key.proxy_host
    }

    pub fn link(&self) -> &Arc<ProxyLink> {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        self.diag.lock().clone()
    }

    /// Connects through the global per-key mutex, learning the cache mode.
    pub async fn connect(&self) -> Result<()> {
        let lock = self.registry.connect_lock(&self.key);
        let _guard = lock.lock().await;

        if self.is_connected() {
            return Ok(());
        }

        if let Some(until) = self.registry.cooldown_until(&self.key) {
            let wait = until.saturating_duration_since(Instant::now());
            debug!(device = %self.key, wait_ms = wait.as_millis() as u64, "honoring connect cooldown");
            tokio::time::sleep(wait).await;
        }

        self.link.await_ready().await?;

        let stored = self.registry.prefs.without_cache(&self.key);
        let forced = self.registry.force_without_cache_active(&self.key);
        let mut without_cache = forced || stored.unwrap_or(false);

        let mut last_err = None;
        for attempt in 0..2u8 {
            match self.connect_attempt(without_cache).await {
                Ok(outcome) => {
                    self.after_connect_success(&outcome, without_cache, stored);
                    return Ok(());
                }
                Err(e) => {
                    self.note_connect_failure(&e);
                    last_err = Some(e);
                    if attempt == 0 {
                        // cleanup, then one retry with the opposite mode
                        let _ = self.link.device_disconnect(self.address).await;
                        let _ = self.link.device_clear_cache(self.address).await;
                        tokio::time::sleep(CLEANUP_PAUSE).await;
                        without_cache = !without_cache;
                    }
                }
            }
        }
        Err(last_err.expect("two attempts always set an error"))
    }

    /// One connect attempt raced against the proxy's log side channel for
    /// this device's MAC.
    async fn connect_attempt(&self, without_cache: bool) -> Result<ConnectOutcome> {
        let mut log_rx = self.link.subscribe_logs(&mac_colon(self.address).to_lowercase());
        let started = Instant::now();

        let result = tokio::select! {
            res = timeout(
                CONNECT_ATTEMPT_TIMEOUT,
                self.link.device_connect(self.address, self.address_type, without_cache),
            ) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BridgeError::BleTimeout(format!(
                    "connect attempt to {} timed out after {CONNECT_ATTEMPT_TIMEOUT:?}",
                    self.key
                ))
                .into()),
            },
            side = Self::log_side_channel(&mut log_rx) => side,
        };

        let duration = started.elapsed();
        {
            let mut diag = self.diag.lock();
            diag.connect_duration_ms = Some(duration.as_millis() as u64);
            diag.used_without_cache = without_cache;
        }

        let outcome = result?;
        if !outcome.connected {
            self.diag.lock().error_code = outcome.error;
            return Err(BridgeError::HardFailure(format!(
                "proxy refused connect to {}, error {}",
                self.key, outcome.error
            ))
            .into());
        }

        if duration > SLOW_CONNECT_THRESHOLD {
            info!(device = %self.key, ms = duration.as_millis() as u64, "slow connect, forcing without-cache for a while");
            self.set_force_without_cache();
        }
        Ok(outcome)
    }

    /// Resolves early when the proxy log narrates the attempt's fate:
    /// an already-established connection, an ignored request, or the
    /// status=133 hard-failure class. Stays pending when the log stream is
    /// quiet (log-level gating), which degrades the race to timeout-only.
    async fn log_side_channel(rx: &mut mpsc::UnboundedReceiver<String>) -> Result<ConnectOutcome> {
        while let Some(line) = rx.recv().await {
            if line.contains("Connection request ignored, state: ESTABLISHED") {
                return Ok(ConnectOutcome {
                    connected: true,
                    error: 0,
                    mtu: None,
                });
            }
            if line.contains("Connection request ignored") {
                return Err(BridgeError::ProxyIgnored(line).into());
            }
            if line.contains("status=133") || line.contains("reason 0x100") {
                return Err(BridgeError::HardFailure(line).into());
            }
        }
        std::future::pending().await
    }

    fn after_connect_success(
        &self,
        outcome: &ConnectOutcome,
        without_cache: bool,
        stored: Option<bool>,
    ) {
        self.connected.store(true, Ordering::SeqCst);
        self.registry.clear_cooldown(&self.key);

        {
            let mut diag = self.diag.lock();
            diag.mtu = outcome.mtu;
            diag.error_code = 0;
            diag.last_connected_at = Some(Utc::now());
            diag.last_error = None;
            diag.cooldown_until = None;
        }

        // learn the mode: persist whenever the successful mode differs from
        // the stored preference, or when a non-default mode had no record
        match stored {
            Some(prior) if prior != without_cache => {
                self.registry.prefs.set_without_cache(&self.key, without_cache);
            }
            None if without_cache => {
                self.registry.prefs.set_without_cache(&self.key, without_cache);
            }
            _ => {}
        }

        if outcome.mtu == Some(0) {
            // empty MTU correlates with the ESP32 status=133 pattern
            self.set_cooldown(MTU_ZERO_COOLDOWN);
        }
    }

    fn note_connect_failure(&self, err: &anyhow::Error) {
        let mut ignored = false;
        let mut hard = false;
        if let Some(bridge) = err.downcast_ref::<BridgeError>() {
            match bridge {
                BridgeError::ProxyIgnored(_) => ignored = true,
                BridgeError::HardFailure(_) => hard = true,
                _ => {}
            }
        }
        {
            let mut diag = self.diag.lock();
            diag.last_error = Some(format!("{err:#}"));
            if ignored {
                diag.ignored_connects += 1;
            }
        }
        if ignored {
            self.set_force_without_cache();
        }
        if hard {
            self.set_cooldown(HARD_FAILURE_COOLDOWN);
        }
    }

    fn set_cooldown(&self, duration: Duration) {
        self.registry.set_cooldown(&self.key, duration);
        self.diag.lock().cooldown_until =
            Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default());
    }

    fn set_force_without_cache(&self) {
        self.registry.set_force_without_cache(&self.key);
        self.diag.lock().force_without_cache_until = Some(
            Utc::now() + chrono::Duration::from_std(FORCE_WITHOUT_CACHE_WINDOW).unwrap_or_default(),
        );
    }

    /// GATT services with the recovery ladder: empty list gets a short
    /// retry, then a cache-clear probe; request timeouts go straight to the
    /// cache-clear probe. The first non-empty list is cached until the next
    /// disconnect clears it.
    pub async fn services(&self) -> Result<Vec<GattService>> {
        if let Some(cached) = self.services.lock().clone() {
            return Ok(cached);
        }

        match self.link.list_services(self.address).await {
            Ok(list) if !list.is_empty() => Ok(self.cache_services(list)),
            Ok(_) => {
                tokio::time::sleep(EMPTY_SERVICES_RETRY_PAUSE).await;
                match self.link.list_services(self.address).await {
                    Ok(list) if !list.is_empty() => Ok(self.cache_services(list)),
                    Ok(_) => self.recover_services(true).await,
                    Err(e) if is_services_timeout(&e) => self.recover_services(false).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) if is_services_timeout(&e) => self.recover_services(false).await,
            Err(e) => Err(e),
        }
    }

    /// Cache-clear recovery: clear, disconnect, reconnect without cache,
    /// retry once. A successful recovery persists the without-cache
    /// preference for this device.
    async fn recover_services(&self, after_empty: bool) -> Result<Vec<GattService>> {
        warn!(device = %self.key, after_empty, "services discovery degraded, running cache-clear recovery");
        let _ = self.link.device_clear_cache(self.address).await;
        self.disconnect("services recovery").await;
        self.connect_without_cache_once().await?;
        if after_empty {
            tokio::time::sleep(RECOVERY_SETTLE_PAUSE).await;
        }
        let list = self.link.list_services(self.address).await?;
        if list.is_empty() {
            return Err(BridgeError::BleTimeout(format!(
                "services for {} still empty after cache-clear recovery",
                self.key
            ))
            .into());
        }
        self.registry.prefs.set_without_cache(&self.key, true);
        Ok(self.cache_services(list))
    }

    /// Single without-cache connect attempt under the global mutex, used by
    /// the services recovery ladder.
    async fn connect_without_cache_once(&self) -> Result<()> {
        let lock = self.registry.connect_lock(&self.key);
        let _guard = lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.link.await_ready().await?;
        let outcome = self.connect_attempt(true).await?;
        self.after_connect_success(&outcome, true, self.registry.prefs.without_cache(&self.key));
        Ok(())
    }

    fn cache_services(&self, list: Vec<GattService>) -> Vec<GattService> {
        *self.services.lock() = Some(list.clone());
        list
    }

    pub async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        match self.link.write_char(self.address, handle, data, with_response).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.diag.lock().last_error = Some(format!("{e:#}"));
                Err(e)
            }
        }
    }

    pub async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        self.link.read_char(self.address, handle).await
    }

    /// Notification stream for a handle. The link replaces any existing
    /// listener for the same handle, so re-subscribing is idempotent.
    pub async fn subscribe_notify(&self, handle: u16) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let rx = self.link.subscribe_notify(self.address, handle).await?;
        self.notify_handles.lock().insert(handle);
        Ok(rx)
    }

    /// Best-effort disconnect; clears the services cache and the flag.
    pub async fn disconnect(&self, reason: &str) {
        let _ = self.link.device_disconnect(self.address).await;
        self.connected.store(false, Ordering::SeqCst);
        *self.services.lock() = None;
        self.diag.lock().last_disconnect_reason = Some(reason.to_string());
    }

    /// Removes every listener this session registered and drops it from the
    /// registry. Construction of a replacement session calls this first.
    pub async fn cleanup(&self) {
        let handles: Vec<u16> = self.notify_handles.lock().drain().collect();
        for handle in handles {
            self.link.unsubscribe_notify(self.address, handle);
        }
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
        self.registry.remove_if_current(&self.key, self);
    }
}

fn is_services_timeout(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("timeout") || msg.contains("bluetoothgattgetservicesdoneresponse")
}
