//! Binary framing for the proxy API.
//!
//! Frame layout on the wire: a zero preamble byte, a varint payload length,
//! a varint message type, then the payload. Payloads are protobuf-style
//! field streams (varint and length-delimited wire types), hand-rolled so
//! the codec has no codegen step. The framing is owned entirely by the
//! proxy link; nothing above it sees frames.

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const PREAMBLE: u8 = 0x00;

/// Message type numbers. Grouped by concern, gaps are intentional.
pub mod msg_type {
    pub const HELLO_REQUEST: u32 = 1;
    pub const HELLO_RESPONSE: u32 = 2;
    pub const AUTH_REQUEST: u32 = 3;
    pub const AUTH_RESPONSE: u32 = 4;
    pub const DISCONNECT_REQUEST: u32 = 5;
    pub const PING_REQUEST: u32 = 7;
    pub const PING_RESPONSE: u32 = 8;
    pub const DEVICE_INFO_REQUEST: u32 = 9;
    pub const DEVICE_INFO_RESPONSE: u32 = 10;
    pub const SUBSCRIBE_LOGS_REQUEST: u32 = 28;
    pub const LOG_RESPONSE: u32 = 29;
    pub const SUBSCRIBE_ADVERTISEMENTS_REQUEST: u32 = 66;
    pub const ADVERTISEMENT_RESPONSE: u32 = 67;
    pub const DEVICE_REQUEST: u32 = 68;
    pub const DEVICE_CONNECTION_RESPONSE: u32 = 69;
    pub const GATT_GET_SERVICES_REQUEST: u32 = 70;
    pub const GATT_GET_SERVICES_RESPONSE: u32 = 71;
    pub const GATT_GET_SERVICES_DONE_RESPONSE: u32 = 72;
    pub const GATT_READ_REQUEST: u32 = 73;
    pub const GATT_READ_RESPONSE: u32 = 74;
    pub const GATT_WRITE_REQUEST: u32 = 75;
    pub const GATT_NOTIFY_REQUEST: u32 = 76;
    pub const GATT_WRITE_RESPONSE: u32 = 77;
    pub const GATT_NOTIFY_RESPONSE: u32 = 78;
    pub const GATT_NOTIFY_DATA_RESPONSE: u32 = 79;
    pub const GATT_ERROR_RESPONSE: u32 = 80;
    pub const UNSUBSCRIBE_ADVERTISEMENTS_REQUEST: u32 = 87;
}

/// Device request subtypes (field `request_type` of [`DeviceRequest`]).
pub mod device_request_type {
    pub const CONNECT: u32 = 0;
    pub const DISCONNECT: u32 = 1;
    pub const CLEAR_CACHE: u32 = 4;
    pub const CONNECT_WITH_CACHE: u32 = 5;
    pub const CONNECT_WITHOUT_CACHE: u32 = 6;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = buf.get(*pos) else {
            bail!("bad format: truncated varint");
        };
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            bail!("bad format: varint overflow");
        }
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// ---- field stream writer ----

#[derive(Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, field: u32, wire_type: u8) {
        encode_varint(u64::from(field << 3 | u32::from(wire_type)), &mut self.buf);
    }

    pub fn varint(&mut self, field: u32, value: u64) {
        self.tag(field, 0);
        encode_varint(value, &mut self.buf);
    }

    pub fn sint(&mut self, field: u32, value: i64) {
        self.tag(field, 0);
        encode_varint(zigzag_encode(value), &mut self.buf);
    }

    pub fn boolean(&mut self, field: u32, value: bool) {
        self.varint(field, u64::from(value));
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        self.tag(field, 2);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    pub fn message(&mut self, field: u32, inner: ProtoWriter) {
        self.bytes(field, &inner.buf);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ---- field stream reader ----

#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_u64(&self) -> u64 {
        match self {
            FieldValue::Varint(v) => *v,
            FieldValue::Bytes(_) => 0,
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.as_u64() as u32
    }

    pub fn as_u16(&self) -> u16 {
        self.as_u64() as u16
    }

    pub fn as_bool(&self) -> bool {
        self.as_u64() != 0
    }

    pub fn as_sint(&self) -> i64 {
        zigzag_decode(self.as_u64())
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            FieldValue::Bytes(b) => b,
            FieldValue::Varint(_) => &[],
        }
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).to_string()
    }
}

pub struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next (field number, value); skips wire types the codec never emits.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            let tag = decode_varint(self.buf, &mut self.pos)?;
            let field = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u8;
            match wire_type {
                0 => {
                    let value = decode_varint(self.buf, &mut self.pos)?;
                    return Ok(Some((field, FieldValue::Varint(value))));
                }
                2 => {
                    let len = decode_varint(self.buf, &mut self.pos)? as usize;
                    let end = self.pos + len;
                    if end > self.buf.len() {
                        bail!("bad format: length-delimited field past end");
                    }
                    let bytes = &self.buf[self.pos..end];
                    self.pos = end;
                    return Ok(Some((field, FieldValue::Bytes(bytes))));
                }
                1 => {
                    if self.pos + 8 > self.buf.len() {
                        bail!("bad format: truncated fixed64");
                    }
                    self.pos += 8;
                }
                5 => {
                    if self.pos + 4 > self.buf.len() {
                        bail!("bad format: truncated fixed32");
                    }
                    self.pos += 4;
                }
                other => bail!("bad format: unsupported wire type {other}"),
            }
        }
    }
}

// ---- frame IO ----

const MAX_FRAME_LEN: u64 = 1 << 20;

async fn read_wire_varint<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            bail!("bad format: varint overflow on wire");
        }
    }
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame> {
    let preamble = reader.read_u8().await?;
    if preamble != PREAMBLE {
        bail!("bad format: unexpected preamble byte 0x{preamble:02x}, unknown protocol selected by server?");
    }
    let len = read_wire_varint(reader).await?;
    if len > MAX_FRAME_LEN {
        bail!("bad format: frame length {len} exceeds limit");
    }
    let msg_type = read_wire_varint(reader).await? as u32;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { msg_type, payload })
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u32,
    payload: &[u8],
) -> Result<()> {
    let mut head = Vec::with_capacity(payload.len() + 8);
    head.push(PREAMBLE);
    encode_varint(payload.len() as u64, &mut head);
    encode_varint(u64::from(msg_type), &mut head);
    head.extend_from_slice(payload);
    writer.write_all(&head).await?;
    writer.flush().await?;
    Ok(())
}

// ---- typed messages ----

#[derive(Debug, Clone, Default)]
pub struct HelloRequest {
    pub client_info: String,
}

impl HelloRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.string(1, &self.client_info);
        w.varint(2, 1); // api major
        w.varint(3, 9); // api minor
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HelloResponse {
    pub server_info: String,
    pub name: String,
}

impl HelloResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                3 => out.server_info = value.as_string(),
                4 => out.name = value.as_string(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, 1);
        w.varint(2, 9);
        w.string(3, &self.server_info);
        w.string(4, &self.name);
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub password: String,
}

impl AuthRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.string(1, &self.password);
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            if field == 1 {
                out.password = value.as_string();
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthResponse {
    pub invalid_password: bool,
}

impl AuthResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            if field == 1 {
                out.invalid_password = value.as_bool();
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.boolean(1, self.invalid_password);
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfoResponse {
    pub name: String,
    pub mac: String,
    pub bluetooth_proxy_feature_flags: u32,
}

impl DeviceInfoResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.name = value.as_string(),
                2 => out.mac = value.as_string(),
                15 => out.bluetooth_proxy_feature_flags = value.as_u32(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.string(1, &self.name);
        w.string(2, &self.mac);
        w.varint(15, u64::from(self.bluetooth_proxy_feature_flags));
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeLogsRequest {
    pub level: u32,
}

impl SubscribeLogsRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, u64::from(self.level));
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogResponse {
    pub level: u32,
    pub message: String,
}

impl LogResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.level = value.as_u32(),
                3 => out.message = value.as_string(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, u64::from(self.level));
        w.string(3, &self.message);
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdvertisementResponse {
    pub address: u64,
    pub name: Vec<u8>,
    pub rssi: i32,
    pub service_uuids: Vec<String>,
    pub manufacturer_data: Vec<Vec<u8>>,
    pub address_type: u32,
}

impl AdvertisementResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.name = value.as_bytes().to_vec(),
                3 => out.rssi = value.as_sint() as i32,
                4 => out.service_uuids.push(value.as_string()),
                6 => out.manufacturer_data.push(value.as_bytes().to_vec()),
                7 => out.address_type = value.as_u32(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.bytes(2, &self.name);
        w.sint(3, i64::from(self.rssi));
        for uuid in &self.service_uuids {
            w.string(4, uuid);
        }
        for data in &self.manufacturer_data {
            w.bytes(6, data);
        }
        w.varint(7, u64::from(self.address_type));
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRequest {
    pub address: u64,
    pub request_type: u32,
    pub has_address_type: bool,
    pub address_type: u32,
}

impl DeviceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.request_type));
        w.boolean(3, self.has_address_type);
        w.varint(4, u64::from(self.address_type));
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.request_type = value.as_u32(),
                3 => out.has_address_type = value.as_bool(),
                4 => out.address_type = value.as_u32(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConnectionResponse {
    pub address: u64,
    pub connected: bool,
    /// None when the proxy omitted the field; Some(0) is a distinct signal
    /// (it correlates with ESP32 status=133 patterns).
    pub mtu: Option<u16>,
    pub error: u16,
}

impl DeviceConnectionResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.connected = value.as_bool(),
                3 => out.mtu = Some(value.as_u16()),
                4 => out.error = value.as_u16(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.boolean(2, self.connected);
        if let Some(mtu) = self.mtu {
            w.varint(3, u64::from(mtu));
        }
        w.varint(4, u64::from(self.error));
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddressedRequest {
    pub address: u64,
}

impl AddressedRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            if field == 1 {
                out.address = value.as_u64();
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WireCharacteristic {
    pub uuid: String,
    pub handle: u16,
    pub properties: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WireService {
    pub uuid: String,
    pub handle: u16,
    pub characteristics: Vec<WireCharacteristic>,
}

impl WireService {
    fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.uuid = value.as_string(),
                2 => out.handle = value.as_u16(),
                3 => {
                    let mut ch = WireCharacteristic::default();
                    let mut cr = ProtoReader::new(value.as_bytes());
                    while let Some((cf, cv)) = cr.next_field()? {
                        match cf {
                            1 => ch.uuid = cv.as_string(),
                            2 => ch.handle = cv.as_u16(),
                            3 => ch.properties = cv.as_u32(),
                            _ => {}
                        }
                    }
                    out.characteristics.push(ch);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn encode(&self) -> ProtoWriter {
        let mut w = ProtoWriter::new();
        w.string(1, &self.uuid);
        w.varint(2, u64::from(self.handle));
        for ch in &self.characteristics {
            let mut cw = ProtoWriter::new();
            cw.string(1, &ch.uuid);
            cw.varint(2, u64::from(ch.handle));
            cw.varint(3, u64::from(ch.properties));
            w.message(3, cw);
        }
        w
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattGetServicesResponse {
    pub address: u64,
    pub services: Vec<WireService>,
}

impl GattGetServicesResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.services.push(WireService::decode(value.as_bytes())?),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        for service in &self.services {
            w.message(2, service.encode());
        }
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattReadRequest {
    pub address: u64,
    pub handle: u16,
}

impl GattReadRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattReadResponse {
    pub address: u64,
    pub handle: u16,
    pub data: Vec<u8>,
}

impl GattReadResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                3 => out.data = value.as_bytes().to_vec(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.bytes(3, &self.data);
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattWriteRequest {
    pub address: u64,
    pub handle: u16,
    pub response: bool,
    pub data: Vec<u8>,
}

impl GattWriteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.boolean(3, self.response);
        w.bytes(4, &self.data);
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                3 => out.response = value.as_bool(),
                4 => out.data = value.as_bytes().to_vec(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattHandleResponse {
    pub address: u64,
    pub handle: u16,
}

impl GattHandleResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattNotifyRequest {
    pub address: u64,
    pub handle: u16,
    pub enable: bool,
}

impl GattNotifyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.boolean(3, self.enable);
        w.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                3 => out.enable = value.as_bool(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattNotifyDataResponse {
    pub address: u64,
    pub handle: u16,
    pub data: Vec<u8>,
}

impl GattNotifyDataResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                3 => out.data = value.as_bytes().to_vec(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.bytes(3, &self.data);
        w.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GattErrorResponse {
    pub address: u64,
    pub handle: u16,
    pub error: u16,
}

impl GattErrorResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut r = ProtoReader::new(payload);
        while let Some((field, value)) = r.next_field()? {
            match field {
                1 => out.address = value.as_u64(),
                2 => out.handle = value.as_u16(),
                3 => out.error = value.as_u16(),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.varint(1, self.address);
        w.varint(2, u64::from(self.handle));
        w.varint(3, u64::from(self.error));
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let mut pos = 0;
            assert_eq!(decode_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn zigzag_roundtrip() {
        for value in [0i64, -1, 1, -70, 127, -128, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn advertisement_roundtrip() {
        let adv = AdvertisementResponse {
            address: 0xfdb4_5c11_22aa,
            name: b"KSBT-FDB45C".to_vec(),
            rssi: -70,
            service_uuids: vec!["0000ffe0-0000-1000-8000-00805f9b34fb".into()],
            manufacturer_data: vec![vec![0x4b, 0x53]],
            address_type: 1,
        };
        let decoded = AdvertisementResponse::decode(&adv.encode()).unwrap();
        assert_eq!(decoded.address, adv.address);
        assert_eq!(decoded.name, adv.name);
        assert_eq!(decoded.rssi, -70);
        assert_eq!(decoded.service_uuids, adv.service_uuids);
        assert_eq!(decoded.manufacturer_data, adv.manufacturer_data);
        assert_eq!(decoded.address_type, 1);
    }

    #[test]
    fn services_response_roundtrip_nested() {
        let resp = GattGetServicesResponse {
            address: 42,
            services: vec![WireService {
                uuid: "ffe0".into(),
                handle: 16,
                characteristics: vec![WireCharacteristic {
                    uuid: "ffe9".into(),
                    handle: 17,
                    properties: 0x0c,
                }],
            }],
        };
        let decoded = GattGetServicesResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.services.len(), 1);
        assert_eq!(decoded.services[0].characteristics[0].handle, 17);
        assert_eq!(decoded.services[0].characteristics[0].properties, 0x0c);
    }

    #[tokio::test]
    async fn frame_io_roundtrip() {
        let mut buf = Vec::new();
        let payload = DeviceRequest {
            address: 7,
            request_type: device_request_type::CONNECT_WITHOUT_CACHE,
            has_address_type: true,
            address_type: 1,
        }
        .encode();
        write_frame(&mut buf, msg_type::DEVICE_REQUEST, &payload)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.msg_type, msg_type::DEVICE_REQUEST);
        let decoded = DeviceRequest::decode(&frame.payload).unwrap();
        assert_eq!(decoded.address, 7);
        assert_eq!(decoded.request_type, device_request_type::CONNECT_WITHOUT_CACHE);
        assert!(decoded.has_address_type);
    }

    #[tokio::test]
    async fn bad_preamble_is_bad_format() {
        let mut cursor = std::io::Cursor::new(vec![0x01, 0x00, 0x07]);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("bad format"));
    }
}
