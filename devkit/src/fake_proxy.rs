//! Scripted fake proxy: a TCP server speaking the bridge's wire framing.
//!
//! Behaviors are scripts per device address (connect outcomes, services
//! responses, proxy log lines), and every observed request is recorded so
//! tests can assert ordering and counts.

use anyhow::Result;
use parking_lot::Mutex;
use smartbed_bridge::models::mac_colon;
use smartbed_bridge::proxy::wire::{
    self, device_request_type, msg_type, AdvertisementResponse, WireCharacteristic, WireService,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// One scripted connect outcome; scripts are consumed front-to-back, and an
/// exhausted script falls back to plain success.
#[derive(Debug, Clone)]
pub enum ConnectStep {
    Success { mtu: Option<u16> },
    Fail { error: u16 },
    /// Emits only a "request ignored" log line, never a response.
    IgnoredLog { state: &'static str },
    /// Emits a status=133 log line, never a response.
    HardFailureLog,
    /// No response and no log line; the caller's timeout decides.
    Silent,
}

/// One scripted services outcome. `List(vec![])` models the empty-list
/// degradation; `Timeout` never answers.
#[derive(Debug, Clone)]
pub enum ServicesStep {
    List(Vec<WireService>),
    Timeout,
}

/// A plausible controller service table.
pub fn default_services() -> Vec<WireService> {
    vec![WireService {
        uuid: "0000ffe5-0000-1000-8000-00805f9b34fb".into(),
        handle: 0x0010,
        characteristics: vec![WireCharacteristic {
            uuid: "0000ffe9-0000-1000-8000-00805f9b34fb".into(),
            handle: 0x0012,
            properties: 0x0c,
        }],
    }]
}

#[derive(Default)]
pub struct FakeProxyBehavior {
    pub server_name: String,
    pub password: Option<String>,
    /// 0 models a proxy without BLE-proxy capability.
    pub feature_flags: u32,
    pub advertisements: Vec<AdvertisementResponse>,
    pub connect_scripts: HashMap<u64, VecDeque<ConnectStep>>,
    pub services_scripts: HashMap<u64, VecDeque<ServicesStep>>,
    /// Payload streamed right after a notify subscription is acknowledged.
    pub notify_data: HashMap<(u64, u16), Vec<u8>>,
    /// Pause before answering a connect request.
    pub connect_delay: Duration,
}

impl FakeProxyBehavior {
    pub fn named(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            feature_flags: 1,
            ..Default::default()
        }
    }

    pub fn with_advertisement(mut self, adv: AdvertisementResponse) -> Self {
        self.advertisements.push(adv);
        self
    }

    pub fn with_connect_script(mut self, address: u64, steps: Vec<ConnectStep>) -> Self {
        self.connect_scripts.insert(address, steps.into());
        self
    }

    pub fn with_services_script(mut self, address: u64, steps: Vec<ServicesStep>) -> Self {
        self.services_scripts.insert(address, steps.into());
        self
    }
}

/// Observable request log.
#[derive(Default)]
pub struct FakeProxyState {
    pub hellos: AtomicU32,
    pub adv_subscriptions: AtomicU32,
    pub clear_cache_requests: AtomicU32,
    pub connects: Mutex<Vec<(u64, u32)>>,
    pub disconnects: Mutex<Vec<u64>>,
    pub writes: Mutex<Vec<(u64, u16, Vec<u8>)>>,
}

impl FakeProxyState {
    pub fn connect_count(&self, address: u64) -> usize {
        self.connects.lock().iter().filter(|(a, _)| *a == address).count()
    }

    pub fn write_payloads(&self, address: u64) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .iter()
            .filter(|(a, _, _)| *a == address)
            .map(|(_, _, data)| data.clone())
            .collect()
    }
}

pub struct FakeProxy {
    pub addr: SocketAddr,
    pub state: Arc<FakeProxyState>,
    pub behavior: Arc<Mutex<FakeProxyBehavior>>,
    accept_task: tokio::task::JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl FakeProxy {
    pub async fn spawn(behavior: FakeProxyBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(FakeProxyState::default());
        let behavior = Arc::new(Mutex::new(behavior));
        let conn_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_behavior = behavior.clone();
        let accept_conn_tasks = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "fake proxy accepted connection");
                let state = accept_state.clone();
                let behavior = accept_behavior.clone();
                let task = tokio::spawn(async move {
                    let _ = serve(stream, behavior, state).await;
                });
                accept_conn_tasks.lock().push(task);
            }
        });

        Ok(Self {
            addr,
            state,
            behavior,
            accept_task,
            conn_tasks,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Severs every live connection and stops accepting new ones.
    pub fn kill(&self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve(
    mut stream: TcpStream,
    behavior: Arc<Mutex<FakeProxyBehavior>>,
    state: Arc<FakeProxyState>,
) -> Result<()> {
    loop {
        let frame = wire::read_frame(&mut stream).await?;
        match frame.msg_type {
            msg_type::HELLO_REQUEST => {
                state.hellos.fetch_add(1, Ordering::SeqCst);
                let name = behavior.lock().server_name.clone();
                let payload = wire::HelloResponse {
                    server_info: format!("{name} (fake-proxy 1.0)"),
                    name,
                }
                .encode();
                wire::write_frame(&mut stream, msg_type::HELLO_RESPONSE, &payload).await?;
            }
            msg_type::AUTH_REQUEST => {
                let request = wire::AuthRequest::decode(&frame.payload)?;
                let invalid_password = behavior
                    .lock()
                    .password
                    .as_ref()
                    .map(|expected| *expected != request.password)
                    .unwrap_or(false);
                let payload = wire::AuthResponse { invalid_password }.encode();
                wire::write_frame(&mut stream, msg_type::AUTH_RESPONSE, &payload).await?;
            }
            msg_type::DEVICE_INFO_REQUEST => {
                let (name, flags) = {
                    let behavior = behavior.lock();
                    (behavior.server_name.clone(), behavior.feature_flags)
                };
                let payload = wire::DeviceInfoResponse {
                    name,
                    mac: "AA:BB:CC:00:11:22".into(),
                    bluetooth_proxy_feature_flags: flags,
                }
                .encode();
                wire::write_frame(&mut stream, msg_type::DEVICE_INFO_RESPONSE, &payload).await?;
            }
            msg_type::SUBSCRIBE_LOGS_REQUEST => {}
            msg_type::SUBSCRIBE_ADVERTISEMENTS_REQUEST => {
                state.adv_subscriptions.fetch_add(1, Ordering::SeqCst);
                let advertisements = behavior.lock().advertisements.clone();
                for adv in advertisements {
                    wire::write_frame(
                        &mut stream,
                        msg_type::ADVERTISEMENT_RESPONSE,
                        &adv.encode(),
                    )
                    .await?;
                }
            }
            msg_type::UNSUBSCRIBE_ADVERTISEMENTS_REQUEST => {}
            msg_type::DEVICE_REQUEST => {
                let request = wire::DeviceRequest::decode(&frame.payload)?;
                handle_device_request(&mut stream, &behavior, &state, request).await?;
            }
            msg_type::GATT_GET_SERVICES_REQUEST => {
                let request = wire::AddressedRequest::decode(&frame.payload)?;
                let step = behavior
                    .lock()
                    .services_scripts
                    .get_mut(&request.address)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| ServicesStep::List(default_services()));
                match step {
                    ServicesStep::Timeout => {}
                    ServicesStep::List(services) => {
                        let payload = wire::GattGetServicesResponse {
                            address: request.address,
                            services,
                        }
                        .encode();
                        wire::write_frame(&mut stream, msg_type::GATT_GET_SERVICES_RESPONSE, &payload)
                            .await?;
                        let done = wire::AddressedRequest {
                            address: request.address,
                        }
                        .encode();
                        wire::write_frame(
                            &mut stream,
                            msg_type::GATT_GET_SERVICES_DONE_RESPONSE,
                            &done,
                        )
                        .await?;
                    }
                }
            }
            msg_type::GATT_WRITE_REQUEST => {
                let request = wire::GattWriteRequest::decode(&frame.payload)?;
                state
                    .writes
                    .lock()
                    .push((request.address, request.handle, request.data.clone()));
                if request.response {
                    let payload = wire::GattHandleResponse {
                        address: request.address,
                        handle: request.handle,
                    }
                    .encode();
                    wire::write_frame(&mut stream, msg_type::GATT_WRITE_RESPONSE, &payload).await?;
                }
            }
            msg_type::GATT_READ_REQUEST => {
                let request = wire::GattReadRequest::decode(&frame.payload)?;
                let payload = wire::GattReadResponse {
                    address: request.address,
                    handle: request.handle,
                    data: vec![0x00],
                }
                .encode();
                wire::write_frame(&mut stream, msg_type::GATT_READ_RESPONSE, &payload).await?;
            }
            msg_type::GATT_NOTIFY_REQUEST => {
                let request = wire::GattNotifyRequest::decode(&frame.payload)?;
                let payload = wire::GattHandleResponse {
                    address: request.address,
                    handle: request.handle,
                }
                .encode();
                wire::write_frame(&mut stream, msg_type::GATT_NOTIFY_RESPONSE, &payload).await?;
                if request.enable {
                    let data = behavior
                        .lock()
                        .notify_data
                        .get(&(request.address, request.handle))
                        .cloned();
                    if let Some(data) = data {
                        let payload = wire::GattNotifyDataResponse {
                            address: request.address,
                            handle: request.handle,
                            data,
                        }
                        .encode();
                        wire::write_frame(&mut stream, msg_type::GATT_NOTIFY_DATA_RESPONSE, &payload)
                            .await?;
                    }
                }
            }
            msg_type::PING_REQUEST => {
                wire::write_frame(&mut stream, msg_type::PING_RESPONSE, &[]).await?;
            }
            msg_type::DISCONNECT_REQUEST => return Ok(()),
            other => {
                debug!(msg_type = other, "fake proxy ignoring frame");
            }
        }
    }
}

async fn handle_device_request(
    stream: &mut TcpStream,
    behavior: &Arc<Mutex<FakeProxyBehavior>>,
    state: &Arc<FakeProxyState>,
    request: wire::DeviceRequest,
) -> Result<()> {
    match request.request_type {
        device_request_type::CONNECT
        | device_request_type::CONNECT_WITH_CACHE
        | device_request_type::CONNECT_WITHOUT_CACHE => {
            state
                .connects
                .lock()
                .push((request.address, request.request_type));
            let (step, delay) = {
                let mut behavior = behavior.lock();
                let step = behavior
                    .connect_scripts
                    .get_mut(&request.address)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(ConnectStep::Success { mtu: Some(247) });
                (step, behavior.connect_delay)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match step {
                ConnectStep::Success { mtu } => {
                    let payload = wire::DeviceConnectionResponse {
                        address: request.address,
                        connected: true,
                        mtu,
                        error: 0,
                    }
                    .encode();
                    wire::write_frame(stream, msg_type::DEVICE_CONNECTION_RESPONSE, &payload)
                        .await?;
                }
                ConnectStep::Fail { error } => {
                    let payload = wire::DeviceConnectionResponse {
                        address: request.address,
                        connected: false,
                        mtu: None,
                        error,
                    }
                    .encode();
                    wire::write_frame(stream, msg_type::DEVICE_CONNECTION_RESPONSE, &payload)
                        .await?;
                }
                ConnectStep::IgnoredLog { state: conn_state } => {
                    send_log(
                        stream,
                        &format!(
                            "[I][esp32_ble_client] [0] [{}] Connection request ignored, state: {conn_state}",
                            mac_colon(request.address)
                        ),
                    )
                    .await?;
                }
                ConnectStep::HardFailureLog => {
                    send_log(
                        stream,
                        &format!(
                            "[W][esp32_ble_client] [0] [{}] Connection failed, status=133",
                            mac_colon(request.address)
                        ),
                    )
                    .await?;
                }
                ConnectStep::Silent => {}
            }
        }
        device_request_type::DISCONNECT => {
            state.disconnects.lock().push(request.address);
            let payload = wire::DeviceConnectionResponse {
                address: request.address,
                connected: false,
                mtu: None,
                error: 0,
            }
            .encode();
            wire::write_frame(stream, msg_type::DEVICE_CONNECTION_RESPONSE, &payload).await?;
        }
        device_request_type::CLEAR_CACHE => {
            state.clear_cache_requests.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }
    Ok(())
}

async fn send_log(stream: &mut TcpStream, message: &str) -> Result<()> {
    let payload = wire::LogResponse {
        level: 3,
        message: message.to_string(),
    }
    .encode();
    wire::write_frame(stream, msg_type::LOG_RESPONSE, &payload).await?;
    Ok(())
}
