//! Advertisement builders for tests.

use smartbed_bridge::proxy::wire::AdvertisementResponse;

/// A named controller advertisement.
pub fn named(name: &str, address: u64, rssi: i32) -> AdvertisementResponse {
    AdvertisementResponse {
        address,
        name: name.as_bytes().to_vec(),
        rssi,
        service_uuids: vec![],
        manufacturer_data: vec![],
        address_type: 0,
    }
}

/// A Keeson-looking controller with its service UUID advertised.
pub fn keeson(name: &str, address: u64, rssi: i32) -> AdvertisementResponse {
    AdvertisementResponse {
        service_uuids: vec!["0000ffe5-0000-1000-8000-00805f9b34fb".to_string()],
        ..named(name, address, rssi)
    }
}

/// An unnamed advertisement; matching falls back to the MAC.
pub fn unnamed(address: u64, rssi: i32) -> AdvertisementResponse {
    AdvertisementResponse {
        address,
        name: Vec::new(),
        rssi,
        service_uuids: vec![],
        manufacturer_data: vec![],
        address_type: 1,
    }
}
