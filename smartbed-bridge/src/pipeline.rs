//! Per-controller command pipeline.
//!
//! Every controller owns one FIFO worker: an entry may not begin until the
//! previous one fully completed, and a failed entry never poisons the
//! queue. Transient write failures get one disconnect/reconnect/retry
//! cycle; repeated identical commands extend the pending repeat timer
//! instead of stacking a second one.

use crate::errors::{
    message_is_api_window, message_is_dead_api, message_is_socket, message_is_transient,
    BridgeError,
};
use crate::health::HealthMonitor;
use crate::session::DeviceSession;
use crate::stats::ControllerStats;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const IDLE_DISCONNECT_AFTER: Duration = Duration::from_secs(60);
const TRANSIENT_RETRY_PAUSE: Duration = Duration::from_millis(300);
/// Back-to-back connect retries while the proxy API finishes its own
/// reconnect window.
const API_WINDOW_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// One queued command. `count`/`wait` describe a repeating command; plain
/// writes use `count = 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub payload: Vec<u8>,
    pub count: u32,
    pub wait: Duration,
}

impl Command {
    pub fn once(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
            count: 1,
            wait: Duration::ZERO,
        }
    }
}

/// What the pipeline needs from a controller: a connectable, writable BLE
/// endpoint with identity for the failure ledgers.
pub trait ControllerPort: Send + Sync + 'static {
    /// Controller friendly-name, the key for health accounting.
    fn device_name(&self) -> &str;
    /// Persisted stats key for the logical bed.
    fn bed_key(&self) -> &str {
        self.device_name()
    }
    /// Persisted stats key for this physical controller.
    fn controller_key(&self) -> &str;
    fn proxy_host(&self) -> &str;
    fn stay_connected(&self) -> bool;
    fn ensure_connected(&self) -> impl Future<Output = Result<()>> + Send;
    fn write(&self, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
    /// Diagnostics snapshot published per device after each operation.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// The production port: a device session plus the vendor's write target.
pub struct SessionPort {
    pub session: Arc<DeviceSession>,
    /// Friendly name shown in health accounting.
    pub bed_name: String,
    /// Configured bed name, the persisted stats key.
    pub bed_key: String,
    pub controller_key: String,
    pub write_handle: u16,
    pub with_response: bool,
    pub stay_connected: bool,
}

impl ControllerPort for SessionPort {
    fn device_name(&self) -> &str {
        &self.bed_name
    }

    fn bed_key(&self) -> &str {
        &self.bed_key
    }

    fn controller_key(&self) -> &str {
        &self.controller_key
    }

    fn proxy_host(&self) -> &str {
        self.session.proxy_host()
    }

    fn stay_connected(&self) -> bool {
        self.stay_connected
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.session.connect().await
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.session
            .write(self.write_handle, payload, self.with_response)
            .await
    }

    async fn disconnect(&self) {
        self.session.disconnect("pipeline requested disconnect").await;
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.session.diagnostics()).unwrap_or(serde_json::Value::Null)
    }
}

pub struct CommandPipeline {
    tx: Option<mpsc::UnboundedSender<Command>>,
    worker: tokio::task::JoinHandle<()>,
    device_name: String,
}

impl CommandPipeline {
    pub fn spawn<P: ControllerPort>(
        port: P,
        health: HealthMonitor,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let device_name = port.device_name().to_string();
        let worker = tokio::spawn(worker_loop(port, health, stats, rx));
        Self {
            tx: Some(tx),
            worker,
            device_name,
        }
    }

    pub fn enqueue(&self, command: Command) {
        if let Some(tx) = &self.tx {
            if tx.send(command).is_err() {
                warn!(device = %self.device_name, "pipeline worker gone, dropping command");
            }
        }
    }

    /// Closes the queue; the worker drains what is left and exits.
    pub fn shutdown(&mut self) {
        self.tx = None;
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn worker_loop<P: ControllerPort>(
    port: P,
    health: HealthMonitor,
    stats: Arc<ControllerStats>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let device = port.device_name().to_string();
    let bed_key = port.bed_key().to_string();
    let controller = port.controller_key().to_string();
    let proxy_host = port.proxy_host().to_string();
    let mut preempted: Option<Command> = None;
    let mut idle_timer_armed = false;

    loop {
        let command = match preempted.take() {
            Some(command) => command,
            None => {
                if idle_timer_armed && !port.stay_connected() {
                    tokio::select! {
                        command = rx.recv() => match command {
                            Some(command) => command,
                            None => break,
                        },
                        _ = sleep(IDLE_DISCONNECT_AFTER) => {
                            debug!(device = %device, "idle, disconnecting controller");
                            port.disconnect().await;
                            idle_timer_armed = false;
                            match rx.recv().await {
                                Some(command) => command,
                                None => break,
                            }
                        }
                    }
                } else {
                    match rx.recv().await {
                        Some(command) => command,
                        None => break,
                    }
                }
            }
        };

        health.record_command(&device, Some(&command.name));
        let result = execute(&port, &health, &command, &mut rx, &mut preempted).await;
        match result {
            Ok(()) => {
                debug!(device = %device, command = %command.name, "command completed");
                health.record_ble_success(&device);
                stats.record_success(&bed_key, &controller);
                idle_timer_armed = true;
            }
            Err(e) => {
                let message = format!("{e:#}");
                let retryable = e
                    .downcast_ref::<BridgeError>()
                    .map(BridgeError::is_retryable)
                    .unwrap_or_else(|| {
                        message_is_transient(&message) || message_is_socket(&message)
                    });
                warn!(device = %device, command = %command.name, error = %message, "command failed");
                health.record_ble_failure(&device, &message, Some(&proxy_host), retryable);
                stats.record_failure(&bed_key, &controller, &message);
            }
        }
        let snapshot = port.snapshot();
        if !snapshot.is_null() {
            health.publish_device_snapshot(&crate::entity::safe_id(&device), &snapshot);
        }
    }
    debug!(device = %device, "pipeline worker exiting");
}

/// Connect, tolerating the proxy API's own reconnect window with short
/// in-place retries. A dead-API-class failure asks for a full restart.
async fn connect_for_command<P: ControllerPort>(port: &P, health: &HealthMonitor) -> Result<()> {
    let mut attempt = 0usize;
    loop {
        match port.ensure_connected().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let message = format!("{e:#}");
                if message_is_dead_api(&message) {
                    health.request_restart("api-dead", &message);
                    return Err(e);
                }
                if message_is_api_window(&message) && attempt < API_WINDOW_DELAYS.len() {
                    info!(error = %message, attempt, "proxy API not ready, waiting out reconnect window");
                    sleep(API_WINDOW_DELAYS[attempt]).await;
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

/// One write, with a single disconnect/reconnect/retry on transient
/// failure.
async fn write_resilient<P: ControllerPort>(
    port: &P,
    health: &HealthMonitor,
    payload: &[u8],
) -> Result<()> {
    match port.write(payload).await {
        Ok(()) => Ok(()),
        Err(e) if message_is_transient(&format!("{e:#}")) => {
            debug!(error = %format!("{e:#}"), "transient write failure, reconnecting once");
            port.disconnect().await;
            sleep(TRANSIENT_RETRY_PAUSE).await;
            connect_for_command(port, health).await?;
            port.write(payload).await
        }
        Err(e) => Err(e),
    }
}

/// Executes one command including its repeat ticks. While waiting between
/// ticks, an identical incoming command extends the remaining count
/// (coalescing); a different one cancels the rest and is handed back to the
/// worker loop.
async fn execute<P: ControllerPort>(
    port: &P,
    health: &HealthMonitor,
    command: &Command,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    preempted: &mut Option<Command>,
) -> Result<()> {
    connect_for_command(port, health).await?;

    let mut remaining = command.count.max(1);
    loop {
        write_resilient(port, health, &command.payload).await?;
        remaining -= 1;
        if remaining == 0 {
            return Ok(());
        }

        let tick = sleep(command.wait);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = &mut tick => break,
                incoming = rx.recv() => match incoming {
                    Some(other) if other.payload == command.payload => {
                        debug!(command = %command.name, extra = other.count, "coalescing identical repeating command");
                        remaining += other.count.max(1);
                    }
                    Some(other) => {
                        debug!(dropped_ticks = remaining, next = %other.name, "repeating command preempted");
                        *preempted = Some(other);
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHandle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable port: per-write results, counters for connect cycles.
    struct MockPort {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        write_script: Arc<Mutex<Vec<Result<(), String>>>>,
        connect_script: Arc<Mutex<Vec<Result<(), String>>>>,
        connects: Arc<AtomicU32>,
        disconnects: Arc<AtomicU32>,
        stay_connected: bool,
    }

    impl MockPort {
        fn new() -> Self {
            Self {
                writes: Arc::new(Mutex::new(Vec::new())),
                write_script: Arc::new(Mutex::new(Vec::new())),
                connect_script: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(AtomicU32::new(0)),
                disconnects: Arc::new(AtomicU32::new(0)),
                stay_connected: true,
            }
        }
    }

    impl ControllerPort for MockPort {
        fn device_name(&self) -> &str {
            "Bed1"
        }

        fn controller_key(&self) -> &str {
            "fdb45c1122aa"
        }

        fn proxy_host(&self) -> &str {
            "10.0.0.50"
        }

        fn stay_connected(&self) -> bool {
            self.stay_connected
        }

        async fn ensure_connected(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.connect_script.lock().pop() {
                Some(Ok(())) | None => Ok(()),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            }
        }

        async fn write(&self, payload: &[u8]) -> Result<()> {
            match self.write_script.lock().pop() {
                Some(Ok(())) | None => {
                    self.writes.lock().push(payload.to_vec());
                    Ok(())
                }
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            }
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture() -> (HealthMonitor, Arc<ControllerStats>, tempfile::TempDir) {
        let (bus, _rx) = BusHandle::recording("ns");
        let health = HealthMonitor::new(bus, "keeson", &[]);
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(ControllerStats::load(dir.path().join("stats.json")));
        (health, stats, dir)
    }

    #[tokio::test]
    async fn commands_complete_in_queue_order() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        let pipeline = CommandPipeline::spawn(port, health, stats.clone());

        for i in 0u8..5 {
            pipeline.enqueue(Command::once(format!("cmd{i}"), vec![i]));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *writes.lock(),
            vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
        );
        assert_eq!(stats.record("Bed1", "fdb45c1122aa").successes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_repeating_commands_coalesce_into_one_timer() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        let pipeline = CommandPipeline::spawn(port, health, stats);

        let preset = Command {
            name: "PresetZeroG".into(),
            payload: vec![0xe5, 0xfe, 0x16, 0x00, 0x10],
            count: 3,
            wait: Duration::from_millis(200),
        };
        pipeline.enqueue(preset.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.enqueue(preset.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;

        // 3 + 3 ticks from a single extended timer, not two overlapping ones
        assert_eq!(writes.lock().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn differing_command_cancels_pending_repeats() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        let pipeline = CommandPipeline::spawn(port, health, stats);

        pipeline.enqueue(Command {
            name: "PresetFlat".into(),
            payload: vec![1],
            count: 5,
            wait: Duration::from_millis(200),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.enqueue(Command::once("PresetTv", vec![2]));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let writes = writes.lock();
        // the first tick of the repeat ran, then the new command took over
        assert_eq!(*writes, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn transient_write_failure_reconnects_and_retries_once() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        let disconnects = port.disconnects.clone();
        port.write_script.lock().push(Err("device not connected".into()));
        let pipeline = CommandPipeline::spawn(port, health.clone(), stats.clone());

        pipeline.enqueue(Command::once("PresetFlat", vec![9]));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(*writes.lock(), vec![vec![9]]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.record("Bed1", "fdb45c1122aa").successes, 1);
        assert_eq!(stats.record("Bed1", "fdb45c1122aa").failures, 0);
    }

    #[tokio::test]
    async fn non_transient_failure_surfaces_without_poisoning_queue() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        port.write_script.lock().push(Err("invalid handle".into()));
        let pipeline = CommandPipeline::spawn(port, health, stats.clone());

        pipeline.enqueue(Command::once("Bad", vec![1]));
        pipeline.enqueue(Command::once("Good", vec![2]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // queue survived the failure
        assert_eq!(*writes.lock(), vec![vec![2]]);
        assert_eq!(stats.record("Bed1", "fdb45c1122aa").failures, 1);
        assert_eq!(stats.record("Bed1", "fdb45c1122aa").successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_api_connect_failure_requests_restart() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        port.connect_script
            .lock()
            .push(Err("write after end".into()));
        let pipeline = CommandPipeline::spawn(port, health.clone(), stats);

        pipeline.enqueue(Command::once("PresetFlat", vec![1]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(health.pending_restart().unwrap().kind, "api-dead");
    }

    #[tokio::test(start_paused = true)]
    async fn api_window_connect_failures_are_waited_out() {
        let (health, stats, _dir) = fixture();
        let port = MockPort::new();
        let writes = port.writes.clone();
        let connects = port.connects.clone();
        {
            let mut script = port.connect_script.lock();
            // popped in reverse order: two not-ready failures, then success
            script.push(Ok(()));
            script.push(Err("esphome api not ready".into()));
            script.push(Err("esphome api not ready".into()));
        }
        let pipeline = CommandPipeline::spawn(port, health, stats);

        pipeline.enqueue(Command::once("PresetFlat", vec![1]));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(*writes.lock(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_disconnect_fires_when_not_stay_connected() {
        let (health, stats, _dir) = fixture();
        let mut port = MockPort::new();
        port.stay_connected = false;
        let disconnects = port.disconnects.clone();
        let pipeline = CommandPipeline::spawn(port, health, stats);

        pipeline.enqueue(Command::once("PresetFlat", vec![1]));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        tokio::time::sleep(IDLE_DISCONNECT_AFTER + Duration::from_secs(2)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
