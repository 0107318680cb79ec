//! Proxy Link: one authorized API session per configured BLE proxy.
//!
//! A link is opened once by the supervisor and then heals brief drops on its
//! own with a short reconnect interval; the readiness gate keeps callers
//! from doing work while the socket is down. Only the supervisor performs a
//! full recreate (on restart signal or a fatal open failure).

pub mod wire;

use crate::errors::BridgeError;
use crate::models::{AddressType, BleAdvertisement, DeviceKey, GattCharacteristic, GattService};
use crate::ratelimit::RateLimitedLog;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const READY_GATE_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_INFO: &str = "smartbed-bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Authorizing,
    Ready,
    Degraded,
    Closed,
}

/// Static proxy endpoint configuration. The expected server name is the one
/// runtime-mutable piece: when the proxy presents a different name, the
/// retry layer pins the presented name here so encrypted sessions still
/// verify on the next attempt.
#[derive(Clone)]
pub struct ProxyLinkConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub encryption_key: Option<String>,
    pub expected_server_name: Arc<Mutex<Option<String>>>,
}

impl ProxyLinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            encryption_key: None,
            expected_server_name: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_options(opts: &crate::config::ProxyOptions) -> Self {
        Self {
            host: opts.host.clone(),
            port: opts.port,
            password: opts.password.clone(),
            encryption_key: opts.encryption_key.clone(),
            expected_server_name: Arc::new(Mutex::new(opts.expected_server_name.clone())),
        }
    }

    /// Replaces the expected server name (mismatch self-correction).
    pub fn pin_server_name(&self, name: &str) {
        *self.expected_server_name.lock() = Some(name.to_string());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOutcome {
    pub connected: bool,
    pub error: u16,
    /// None when the proxy did not report an MTU at all.
    pub mtu: Option<u16>,
}

/// Connection state change reported by the proxy outside of any in-flight
/// request. Consumers only update flags from these; they never reconnect.
#[derive(Debug, Clone, Copy)]
pub struct ConnEvent {
    pub address: u64,
    pub connected: bool,
    pub error: u16,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
enum PendingKey {
    Connect(u64),
    Read(u64, u16),
    Write(u64, u16),
    Notify(u64, u16),
}

#[derive(Debug)]
enum Reply {
    Connection(wire::DeviceConnectionResponse),
    Data(Vec<u8>),
    Ack,
}

type PendingTx = oneshot::Sender<Result<Reply>>;

struct ServicesPending {
    collected: Vec<GattService>,
    tx: oneshot::Sender<Vec<GattService>>,
}

struct LinkShared {
    host: String,
    state: Mutex<LinkState>,
    ready_tx: watch::Sender<bool>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<(u32, Vec<u8>)>>>,
    pending: Mutex<HashMap<PendingKey, PendingTx>>,
    services_pending: Mutex<HashMap<u64, ServicesPending>>,
    adv_tx: Mutex<Option<mpsc::UnboundedSender<BleAdvertisement>>>,
    adv_subscribed: AtomicBool,
    log_routes: Mutex<Vec<(String, mpsc::UnboundedSender<String>)>>,
    notify_routes: Mutex<HashMap<(u64, u16), mpsc::UnboundedSender<Vec<u8>>>>,
    conn_events: broadcast::Sender<ConnEvent>,
    closed: AtomicBool,
    io_abort: Notify,
    force_reconnect: AtomicBool,
    limiter: RateLimitedLog,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    fn set_ready(&self, ready: bool) {
        let _ = self.ready_tx.send(ready);
    }

    fn fail_pending(&self, reason: &str) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(BridgeError::Socket(reason.to_string()).into()));
        }
        self.services_pending.lock().clear();
    }

    fn clear_listeners(&self) {
        *self.adv_tx.lock() = None;
        self.adv_subscribed.store(false, Ordering::SeqCst);
        self.log_routes.lock().clear();
        self.notify_routes.lock().clear();
    }
}

pub struct ProxyLink {
    cfg: ProxyLinkConfig,
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for ProxyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLink").finish_non_exhaustive()
    }
}

impl ProxyLink {
    /// Opens the link: transport connect, authorize, feature-flags probe.
    /// Completes only once all three are observed; any failure closes the
    /// socket and clears listeners before returning so a half-open session
    /// never lingers holding the proxy's single-subscriber slot.
    pub async fn open(cfg: ProxyLinkConfig) -> Result<Arc<Self>> {
        let (ready_tx, _) = watch::channel(false);
        let (conn_events, _) = broadcast::channel(64);
        let shared = Arc::new(LinkShared {
            host: cfg.host.clone(),
            state: Mutex::new(LinkState::Dialing),
            ready_tx,
            writer_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            services_pending: Mutex::new(HashMap::new()),
            adv_tx: Mutex::new(None),
            adv_subscribed: AtomicBool::new(false),
            log_routes: Mutex::new(Vec::new()),
            notify_routes: Mutex::new(HashMap::new()),
            conn_events,
            closed: AtomicBool::new(false),
            io_abort: Notify::new(),
            force_reconnect: AtomicBool::new(false),
            limiter: RateLimitedLog::default(),
        });

        let stream = match timeout(OPEN_TIMEOUT, establish(&cfg, &shared)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.set_state(LinkState::Closed);
                shared.clear_listeners();
                return Err(e);
            }
            Err(_) => {
                shared.set_state(LinkState::Closed);
                shared.clear_listeners();
                return Err(BridgeError::Socket(format!(
                    "proxy {} open timed out after {OPEN_TIMEOUT:?}",
                    cfg.host
                ))
                .into());
            }
        };

        let link = Arc::new(Self {
            cfg: cfg.clone(),
            shared: shared.clone(),
        });
        shared.set_state(LinkState::Ready);
        shared.set_ready(true);
        info!(host = %cfg.host, "proxy link ready");
        spawn_run(cfg, shared, stream);
        Ok(link)
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    pub fn device_key(&self, address: u64) -> DeviceKey {
        DeviceKey::new(self.shared.host.clone(), address)
    }

    pub fn expected_server_name(&self) -> Option<String> {
        self.cfg.expected_server_name.lock().clone()
    }

    /// Bounded wait for `connected && authorized`. Expiry is the retryable
    /// `ApiNotReady` kind.
    pub async fn await_ready(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Socket(format!("proxy {} link closed", self.shared.host)).into());
        }
        let mut rx = self.shared.ready_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        match timeout(READY_GATE_TIMEOUT, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() {
                    return true;
                }
            }
        })
        .await
        {
            Ok(true) => Ok(()),
            _ => Err(BridgeError::ApiNotReady(READY_GATE_TIMEOUT).into()),
        }
    }

    fn send(&self, msg_type: u32, payload: Vec<u8>) -> Result<()> {
        let guard = self.shared.writer_tx.lock();
        match guard.as_ref() {
            Some(tx) if tx.send((msg_type, payload)).is_ok() => Ok(()),
            _ => Err(BridgeError::Socket(format!(
                "proxy {} socket is not connected",
                self.shared.host
            ))
            .into()),
        }
    }

    fn register_pending(&self, key: PendingKey) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(key, tx);
        rx
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<Reply>>,
        wait: Option<Duration>,
        what: &str,
    ) -> Result<Reply> {
        let fut = async {
            rx.await.map_err(|_| {
                anyhow::Error::from(BridgeError::Socket(format!(
                    "proxy {} link reset while waiting for {what}",
                    self.shared.host
                )))
            })?
        };
        match wait {
            Some(d) => match timeout(d, fut).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::BleTimeout(format!("{what} timeout after {d:?}")).into()),
            },
            None => fut.await,
        }
    }

    /// Registers the advertisement listener (single slot per link; replacing
    /// it deregisters the prior one) and asks the proxy to start streaming.
    pub async fn subscribe_advertisements(&self) -> Result<mpsc::UnboundedReceiver<BleAdvertisement>> {
        self.await_ready().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.adv_tx.lock() = Some(tx);
        self.shared.adv_subscribed.store(true, Ordering::SeqCst);
        self.send(
            wire::msg_type::SUBSCRIBE_ADVERTISEMENTS_REQUEST,
            Vec::new(),
        )?;
        Ok(rx)
    }

    pub fn unsubscribe_advertisements(&self) {
        *self.shared.adv_tx.lock() = None;
        self.shared.adv_subscribed.store(false, Ordering::SeqCst);
        let _ = self.send(wire::msg_type::UNSUBSCRIBE_ADVERTISEMENTS_REQUEST, Vec::new());
    }

    /// Connect request. The caller owns the per-attempt timeout; the link
    /// only guards against a reset socket.
    pub async fn device_connect(
        &self,
        address: u64,
        address_type: AddressType,
        without_cache: bool,
    ) -> Result<ConnectOutcome> {
        self.await_ready().await?;
        let rx = self.register_pending(PendingKey::Connect(address));
        let request_type = if without_cache {
            wire::device_request_type::CONNECT_WITHOUT_CACHE
        } else {
            wire::device_request_type::CONNECT_WITH_CACHE
        };
        self.send(
            wire::msg_type::DEVICE_REQUEST,
            wire::DeviceRequest {
                address,
                request_type,
                has_address_type: true,
                address_type: u32::from(address_type.as_u8()),
            }
            .encode(),
        )?;
        match self.await_reply(rx, None, "connect response").await? {
            Reply::Connection(resp) => Ok(ConnectOutcome {
                connected: resp.connected,
                error: resp.error,
                mtu: resp.mtu,
            }),
            other => Err(BridgeError::Socket(format!("unexpected reply {other:?}")).into()),
        }
    }

    /// Fire-and-forget; the proxy reports the result as an async connection
    /// event.
    pub async fn device_disconnect(&self, address: u64) -> Result<()> {
        self.await_ready().await?;
        self.send(
            wire::msg_type::DEVICE_REQUEST,
            wire::DeviceRequest {
                address,
                request_type: wire::device_request_type::DISCONNECT,
                ..Default::default()
            }
            .encode(),
        )
    }

    pub async fn device_clear_cache(&self, address: u64) -> Result<()> {
        self.await_ready().await?;
        self.send(
            wire::msg_type::DEVICE_REQUEST,
            wire::DeviceRequest {
                address,
                request_type: wire::device_request_type::CLEAR_CACHE,
                ..Default::default()
            }
            .encode(),
        )
    }

    /// GATT services listing. The timeout message carries the done-response
    /// marker so the session's recovery ladder can recognize it.
    pub async fn list_services(&self, address: u64) -> Result<Vec<GattService>> {
        self.await_ready().await?;
        let (tx, rx) = oneshot::channel();
        self.shared.services_pending.lock().insert(
            address,
            ServicesPending {
                collected: Vec::new(),
                tx,
            },
        );
        self.send(
            wire::msg_type::GATT_GET_SERVICES_REQUEST,
            wire::AddressedRequest { address }.encode(),
        )?;
        match timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(services)) => Ok(services),
            Ok(Err(_)) => Err(BridgeError::Socket(format!(
                "proxy {} link reset during services discovery",
                self.shared.host
            ))
            .into()),
            Err(_) => {
                self.shared.services_pending.lock().remove(&address);
                Err(BridgeError::BleTimeout(format!(
                    "timeout waiting for BluetoothGATTGetServicesDoneResponse from {address:#x}"
                ))
                .into())
            }
        }
    }

    pub async fn write_char(
        &self,
        address: u64,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.await_ready().await?;
        let rx = with_response.then(|| self.register_pending(PendingKey::Write(address, handle)));
        self.send(
            wire::msg_type::GATT_WRITE_REQUEST,
            wire::GattWriteRequest {
                address,
                handle,
                response: with_response,
                data: data.to_vec(),
            }
            .encode(),
        )?;
        if let Some(rx) = rx {
            self.await_reply(rx, Some(RESPONSE_TIMEOUT), "GATT write response")
                .await?;
        }
        Ok(())
    }

    pub async fn read_char(&self, address: u64, handle: u16) -> Result<Vec<u8>> {
        self.await_ready().await?;
        let rx = self.register_pending(PendingKey::Read(address, handle));
        self.send(
            wire::msg_type::GATT_READ_REQUEST,
            wire::GattReadRequest { address, handle }.encode(),
        )?;
        match self
            .await_reply(rx, Some(RESPONSE_TIMEOUT), "GATT read response")
            .await?
        {
            Reply::Data(data) => Ok(data),
            other => Err(BridgeError::Socket(format!("unexpected reply {other:?}")).into()),
        }
    }

    /// Enables notifications on a handle. Replacing an existing listener for
    /// the same handle deregisters the prior one first (the old receiver
    /// closes), so repeat subscriptions cannot accumulate.
    pub async fn subscribe_notify(
        &self,
        address: u64,
        handle: u16,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.await_ready().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.notify_routes.lock().insert((address, handle), tx);
        let ack = self.register_pending(PendingKey::Notify(address, handle));
        self.send(
            wire::msg_type::GATT_NOTIFY_REQUEST,
            wire::GattNotifyRequest {
                address,
                handle,
                enable: true,
            }
            .encode(),
        )?;
        self.await_reply(ack, Some(RESPONSE_TIMEOUT), "GATT notify response")
            .await?;
        Ok(rx)
    }

    pub fn unsubscribe_notify(&self, address: u64, handle: u16) {
        self.shared.notify_routes.lock().remove(&(address, handle));
        let _ = self.send(
            wire::msg_type::GATT_NOTIFY_REQUEST,
            wire::GattNotifyRequest {
                address,
                handle,
                enable: false,
            }
            .encode(),
        );
    }

    /// Stream of proxy log lines whose text contains `filter`
    /// (case-insensitive). Used by the session connect race.
    pub fn subscribe_logs(&self, filter: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .log_routes
            .lock()
            .push((filter.to_lowercase(), tx));
        rx
    }

    pub fn subscribe_conn_events(&self) -> broadcast::Receiver<ConnEvent> {
        self.shared.conn_events.subscribe()
    }

    /// Forces a full socket cycle now (silent-subscription heal). Resolves
    /// once the link is ready again or the open timeout elapses.
    pub async fn reconnect(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Socket(format!("proxy {} link closed", self.shared.host)).into());
        }
        info!(host = %self.shared.host, "forcing proxy link reconnect");
        self.shared.force_reconnect.store(true, Ordering::SeqCst);
        self.shared.io_abort.notify_waiters();
        let mut rx = self.shared.ready_tx.subscribe();
        match timeout(OPEN_TIMEOUT, async {
            loop {
                if *rx.borrow() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        {
            Ok(true) => Ok(()),
            _ => Err(BridgeError::Socket(format!(
                "proxy {} did not come back after forced reconnect",
                self.shared.host
            ))
            .into()),
        }
    }

    /// Closes the socket and clears every listener this link registered.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.set_state(LinkState::Closed);
        self.shared.set_ready(false);
        self.shared.io_abort.notify_waiters();
        self.shared.fail_pending("link closed");
        self.shared.clear_listeners();
        debug!(host = %self.shared.host, "proxy link closed");
    }
}

/// Dial + hello + authorize + feature probe, sequentially on a fresh
/// socket. Any error drops the socket on the way out.
async fn establish(cfg: &ProxyLinkConfig, shared: &Arc<LinkShared>) -> Result<TcpStream> {
    shared.set_state(LinkState::Dialing);
    let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .await
        .map_err(|e| BridgeError::Socket(format!("connect {}:{}: {e}", cfg.host, cfg.port)))?;

    wire::write_frame(
        &mut stream,
        wire::msg_type::HELLO_REQUEST,
        &wire::HelloRequest {
            client_info: CLIENT_INFO.to_string(),
        }
        .encode(),
    )
    .await?;
    let hello = read_expect(&mut stream, wire::msg_type::HELLO_RESPONSE).await?;
    let hello = wire::HelloResponse::decode(&hello.payload)?;

    let expected = cfg.expected_server_name.lock().clone();
    match expected {
        Some(expected) if expected != hello.name => {
            return Err(BridgeError::NameMismatch {
                expected,
                presented: hello.name,
            }
            .into());
        }
        None => {
            // pin the first presented name so later sessions still verify
            cfg.pin_server_name(&hello.name);
        }
        _ => {}
    }

    shared.set_state(LinkState::Authorizing);
    wire::write_frame(
        &mut stream,
        wire::msg_type::AUTH_REQUEST,
        &wire::AuthRequest {
            password: cfg.password.clone().unwrap_or_default(),
        }
        .encode(),
    )
    .await?;
    let auth = read_expect(&mut stream, wire::msg_type::AUTH_RESPONSE).await?;
    let auth = wire::AuthResponse::decode(&auth.payload)?;
    if auth.invalid_password {
        return Err(BridgeError::Socket(format!(
            "proxy {} rejected credentials: not authorized",
            cfg.host
        ))
        .into());
    }

    wire::write_frame(&mut stream, wire::msg_type::DEVICE_INFO_REQUEST, &[]).await?;
    let info = read_expect(&mut stream, wire::msg_type::DEVICE_INFO_RESPONSE).await?;
    let info = wire::DeviceInfoResponse::decode(&info.payload)?;
    if info.bluetooth_proxy_feature_flags == 0 {
        return Err(BridgeError::Socket(format!(
            "proxy {} does not advertise BLE-proxy feature flags",
            cfg.host
        ))
        .into());
    }

    // proxy log stream feeds the connect side channel; best-effort
    wire::write_frame(
        &mut stream,
        wire::msg_type::SUBSCRIBE_LOGS_REQUEST,
        &wire::SubscribeLogsRequest { level: 5 }.encode(),
    )
    .await?;

    if shared.adv_subscribed.load(Ordering::SeqCst) {
        wire::write_frame(
            &mut stream,
            wire::msg_type::SUBSCRIBE_ADVERTISEMENTS_REQUEST,
            &[],
        )
        .await?;
    }

    Ok(stream)
}

/// Reads frames until one of the wanted type arrives, answering pings and
/// discarding early log lines.
async fn read_expect(stream: &mut TcpStream, wanted: u32) -> Result<wire::Frame> {
    loop {
        let frame = wire::read_frame(stream).await?;
        if frame.msg_type == wanted {
            return Ok(frame);
        }
        if frame.msg_type == wire::msg_type::PING_REQUEST {
            wire::write_frame(stream, wire::msg_type::PING_RESPONSE, &[]).await?;
        }
    }
}

struct IoHalves {
    reader: tokio::net::tcp::OwnedReadHalf,
    writer_tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
    writer_task: tokio::task::JoinHandle<()>,
}

/// Splits the socket and registers the writer channel synchronously, so a
/// caller returning from `open` can send immediately.
fn attach_io(shared: &Arc<LinkShared>, stream: TcpStream) -> IoHalves {
    let (reader, mut writer) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<(u32, Vec<u8>)>();
    *shared.writer_tx.lock() = Some(writer_tx.clone());
    let writer_task = tokio::spawn(async move {
        while let Some((msg_type, payload)) = writer_rx.recv().await {
            if let Err(e) = wire::write_frame(&mut writer, msg_type, &payload).await {
                debug!(error = %e, "proxy writer stopped");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    IoHalves {
        reader,
        writer_tx,
        writer_task,
    }
}

fn spawn_run(cfg: ProxyLinkConfig, shared: Arc<LinkShared>, initial: TcpStream) {
    let mut io = Some(attach_io(&shared, initial));
    tokio::spawn(async move {
        loop {
            let current = match io.take() {
                Some(io) => io,
                None => {
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if !shared.force_reconnect.swap(false, Ordering::SeqCst) {
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                    }
                    match timeout(OPEN_TIMEOUT, establish(&cfg, &shared)).await {
                        Ok(Ok(s)) => {
                            let io = attach_io(&shared, s);
                            shared.set_state(LinkState::Ready);
                            shared.set_ready(true);
                            info!(host = %shared.host, "proxy link re-established");
                            io
                        }
                        Ok(Err(e)) => {
                            if shared.limiter.should_log(&format!("reconnect:{}", shared.host)) {
                                warn!(host = %shared.host, error = %format!("{e:#}"), "proxy reconnect failed");
                            }
                            continue;
                        }
                        Err(_) => {
                            if shared.limiter.should_log(&format!("reconnect:{}", shared.host)) {
                                warn!(host = %shared.host, "proxy reconnect timed out");
                            }
                            continue;
                        }
                    }
                }
            };

            read_loop(&shared, current).await;
            shared.set_ready(false);
            shared.fail_pending("proxy socket dropped");
            if shared.closed.load(Ordering::SeqCst) {
                shared.set_state(LinkState::Closed);
                break;
            }
            shared.set_state(LinkState::Degraded);
        }
    });
}

/// Reads frames until an IO error, a server disconnect, or an abort signal.
async fn read_loop(shared: &Arc<LinkShared>, io: IoHalves) {
    let IoHalves {
        mut reader,
        writer_tx,
        writer_task,
    } = io;
    let abort = shared.io_abort.notified();
    tokio::pin!(abort);

    loop {
        if shared.closed.load(Ordering::SeqCst) || shared.force_reconnect.load(Ordering::SeqCst) {
            break;
        }
        let frame = tokio::select! {
            frame = wire::read_frame(&mut reader) => frame,
            _ = &mut abort => break,
        };
        match frame {
            Ok(frame) => dispatch(shared, &writer_tx, frame),
            Err(e) => {
                if !shared.closed.load(Ordering::SeqCst)
                    && shared.limiter.should_log(&format!("read:{}", shared.host))
                {
                    warn!(host = %shared.host, error = %format!("{e:#}"), "proxy read failed");
                }
                break;
            }
        }
    }

    *shared.writer_tx.lock() = None;
    writer_task.abort();
}

fn dispatch(shared: &Arc<LinkShared>, writer_tx: &mpsc::UnboundedSender<(u32, Vec<u8>)>, frame: wire::Frame) {
    use wire::msg_type as t;
    match frame.msg_type {
        t::PING_REQUEST => {
            let _ = writer_tx.send((t::PING_RESPONSE, Vec::new()));
        }
        t::ADVERTISEMENT_RESPONSE => {
            if let Ok(adv) = wire::AdvertisementResponse::decode(&frame.payload) {
                let name = String::from_utf8_lossy(&adv.name).trim().to_string();
                let advertisement = BleAdvertisement {
                    name: (!name.is_empty()).then_some(name),
                    address: adv.address,
                    address_type: AddressType::from_u8(adv.address_type as u8),
                    rssi: adv.rssi,
                    manufacturer_data: adv.manufacturer_data,
                    service_uuids: adv.service_uuids,
                };
                let mut slot = shared.adv_tx.lock();
                if let Some(tx) = slot.as_ref() {
                    if tx.send(advertisement).is_err() {
                        *slot = None;
                    }
                }
            }
        }
        t::DEVICE_CONNECTION_RESPONSE => {
            if let Ok(resp) = wire::DeviceConnectionResponse::decode(&frame.payload) {
                let key = PendingKey::Connect(resp.address);
                let waiter = shared.pending.lock().remove(&key);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(Reply::Connection(resp)));
                    }
                    None => {
                        // async state change: consumers only flip their
                        // connected flag, nobody reconnects off this
                        let _ = shared.conn_events.send(ConnEvent {
                            address: resp.address,
                            connected: resp.connected,
                            error: resp.error,
                        });
                    }
                }
            }
        }
        t::GATT_GET_SERVICES_RESPONSE => {
            if let Ok(resp) = wire::GattGetServicesResponse::decode(&frame.payload) {
                if let Some(pending) = shared.services_pending.lock().get_mut(&resp.address) {
                    pending
                        .collected
                        .extend(resp.services.into_iter().map(|s| GattService {
                            uuid: s.uuid,
                            handle: s.handle,
                            characteristics: s
                                .characteristics
                                .into_iter()
                                .map(|c| GattCharacteristic {
                                    uuid: c.uuid,
                                    handle: c.handle,
                                    properties: c.properties,
                                })
                                .collect(),
                        }));
                }
            }
        }
        t::GATT_GET_SERVICES_DONE_RESPONSE => {
            if let Ok(done) = wire::AddressedRequest::decode(&frame.payload) {
                if let Some(pending) = shared.services_pending.lock().remove(&done.address) {
                    let _ = pending.tx.send(pending.collected);
                }
            }
        }
        t::GATT_READ_RESPONSE => {
            if let Ok(resp) = wire::GattReadResponse::decode(&frame.payload) {
                if let Some(tx) = shared
                    .pending
                    .lock()
                    .remove(&PendingKey::Read(resp.address, resp.handle))
                {
                    let _ = tx.send(Ok(Reply::Data(resp.data)));
                }
            }
        }
        t::GATT_WRITE_RESPONSE => {
            if let Ok(resp) = wire::GattHandleResponse::decode(&frame.payload) {
                if let Some(tx) = shared
                    .pending
                    .lock()
                    .remove(&PendingKey::Write(resp.address, resp.handle))
                {
                    let _ = tx.send(Ok(Reply::Ack));
                }
            }
        }
        t::GATT_NOTIFY_RESPONSE => {
            if let Ok(resp) = wire::GattHandleResponse::decode(&frame.payload) {
                if let Some(tx) = shared
                    .pending
                    .lock()
                    .remove(&PendingKey::Notify(resp.address, resp.handle))
                {
                    let _ = tx.send(Ok(Reply::Ack));
                }
            }
        }
        t::GATT_NOTIFY_DATA_RESPONSE => {
            if let Ok(resp) = wire::GattNotifyDataResponse::decode(&frame.payload) {
                let mut routes = shared.notify_routes.lock();
                if let Some(tx) = routes.get(&(resp.address, resp.handle)) {
                    if tx.send(resp.data).is_err() {
                        routes.remove(&(resp.address, resp.handle));
                    }
                }
            }
        }
        t::GATT_ERROR_RESPONSE => {
            if let Ok(resp) = wire::GattErrorResponse::decode(&frame.payload) {
                let mut pending = shared.pending.lock();
                for key in [
                    PendingKey::Write(resp.address, resp.handle),
                    PendingKey::Read(resp.address, resp.handle),
                    PendingKey::Notify(resp.address, resp.handle),
                ] {
                    if let Some(tx) = pending.remove(&key) {
                        let _ = tx.send(Err(BridgeError::HardFailure(format!(
                            "gatt error status={} on handle {}",
                            resp.error, resp.handle
                        ))
                        .into()));
                    }
                }
            }
        }
        t::LOG_RESPONSE => {
            if let Ok(log) = wire::LogResponse::decode(&frame.payload) {
                let line_lower = log.message.to_lowercase();
                let mut routes = shared.log_routes.lock();
                routes.retain(|(filter, tx)| {
                    if line_lower.contains(filter.as_str()) {
                        tx.send(log.message.clone()).is_ok()
                    } else {
                        !tx.is_closed()
                    }
                });
            }
        }
        t::DISCONNECT_REQUEST => {
            debug!(host = %shared.host, "proxy requested disconnect");
        }
        other => {
            debug!(host = %shared.host, msg_type = other, "unhandled proxy frame");
        }
    }
}
