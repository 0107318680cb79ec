//! Core data model shared between all modules.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn as_u8(self) -> u8 {
        match self {
            AddressType::Public => 0,
            AddressType::Random => 1,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        if v == 0 {
            AddressType::Public
        } else {
            AddressType::Random
        }
    }
}

/// One BLE advertisement as delivered by a proxy. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleAdvertisement {
    pub name: Option<String>,
    /// 48-bit device address.
    pub address: u64,
    pub address_type: AddressType,
    pub rssi: i32,
    pub manufacturer_data: Vec<Vec<u8>>,
    pub service_uuids: Vec<String>,
}

impl BleAdvertisement {
    /// 12-hex lowercase form of the address.
    pub fn mac_hex(&self) -> String {
        format!("{:012x}", self.address)
    }

    /// Colon-separated MAC, the form the proxy prints in its log lines.
    pub fn mac_colon(&self) -> String {
        mac_colon(self.address)
    }

    /// Advertised name, falling back to the MAC for unnamed advertisements.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) if !n.trim().is_empty() => n.clone(),
            _ => self.mac_hex(),
        }
    }
}

pub fn mac_colon(address: u64) -> String {
    let b = address.to_be_bytes();
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

/// Scope of the global connect mutex and every per-device preference lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub proxy_host: String,
    pub address: u64,
}

impl DeviceKey {
    pub fn new(proxy_host: impl Into<String>, address: u64) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            address,
        }
    }

    pub fn mac_hex(&self) -> String {
        format!("{:012x}", self.address)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.proxy_host, self.address)
    }
}

/// One GATT service as reported by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: String,
    pub handle: u16,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub handle: u16,
    pub properties: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        let adv = BleAdvertisement {
            name: None,
            address: 0x0000_fdb4_5c11_22aa,
            address_type: AddressType::Public,
            rssi: -70,
            manufacturer_data: vec![],
            service_uuids: vec![],
        };
        assert_eq!(adv.mac_hex(), "fdb45c1122aa");
        assert_eq!(adv.mac_colon(), "FD:B4:5C:11:22:AA");
        // unnamed advertisements fall back to the hex MAC
        assert_eq!(adv.display_name(), "fdb45c1122aa");
    }

    #[test]
    fn device_key_display() {
        let key = DeviceKey::new("10.0.0.50", 42);
        assert_eq!(key.to_string(), "10.0.0.50:42");
    }
}
