//! Vendor seam: the probe deciding whether an advertisement is one of ours,
//! and the controller plan (write target + command set) for a supported
//! model. The byte builders per family live here; everything else in the
//! bridge is vendor-agnostic.

use crate::config::VendorFamily;
use crate::entity::EntityDescriptor;
use crate::models::BleAdvertisement;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BedCommand {
    pub name: &'static str,
    pub description: &'static str,
    pub payload: Vec<u8>,
    pub count: u32,
    pub wait: Duration,
}

impl BedCommand {
    pub fn entity(&self) -> EntityDescriptor {
        EntityDescriptor {
            component: "button",
            tag: Some(self.name.to_string()),
            description: self.description.to_string(),
        }
    }
}

/// Everything needed to drive one supported controller.
#[derive(Debug, Clone)]
pub struct ControllerPlan {
    pub write_handle: u16,
    pub with_response: bool,
    pub commands: Vec<BedCommand>,
}

pub trait BedVendor: Send + Sync {
    fn manufacturer(&self) -> &'static str;
    /// Model probe. A pinned-but-asleep controller may be inoperative
    /// while its linked twin identifies the same model, so this runs per
    /// candidate, not per bed.
    fn is_supported(&self, adv: &BleAdvertisement) -> bool;
    /// Builds the controller plan, or None when the model probe passed but
    /// the advertisement carries no usable variant.
    fn plan(&self, adv: &BleAdvertisement) -> Option<ControllerPlan>;
}

pub fn vendor_for(family: VendorFamily) -> Arc<dyn BedVendor> {
    match family {
        VendorFamily::Keeson => Arc::new(KeesonVendor),
        VendorFamily::Octo => Arc::new(OctoVendor),
    }
}

// ---- Keeson ----

const KEESON_NAME_PREFIXES: &[&str] = &["ksbt", "base-i", "keeson", "okin"];
const KEESON_WRITE_HANDLE: u16 = 0x0012;

/// Keeson frame: e5 fe 16 + 4 command bytes (LE) + complement checksum.
fn keeson_frame(code: u32) -> Vec<u8> {
    let mut out = vec![0xe5, 0xfe, 0x16];
    out.extend_from_slice(&code.to_le_bytes());
    let sum: u32 = out.iter().map(|b| u32::from(*b)).sum();
    out.push((0xff - (sum & 0xff)) as u8);
    out
}

pub struct KeesonVendor;

impl BedVendor for KeesonVendor {
    fn manufacturer(&self) -> &'static str {
        "Keeson"
    }

    fn is_supported(&self, adv: &BleAdvertisement) -> bool {
        let name = adv.display_name().to_lowercase();
        KEESON_NAME_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
            || adv
                .service_uuids
                .iter()
                .any(|uuid| uuid.to_lowercase().starts_with("0000ffe5"))
    }

    fn plan(&self, adv: &BleAdvertisement) -> Option<ControllerPlan> {
        if !self.is_supported(adv) {
            return None;
        }
        Some(ControllerPlan {
            write_handle: KEESON_WRITE_HANDLE,
            with_response: false,
            commands: vec![
                BedCommand {
                    name: "preset_flat",
                    description: "Preset Flat",
                    payload: keeson_frame(0x0800_0000),
                    count: 3,
                    wait: Duration::from_millis(200),
                },
                BedCommand {
                    name: "preset_zerog",
                    description: "Preset ZeroG",
                    payload: keeson_frame(0x0000_1000),
                    count: 3,
                    wait: Duration::from_millis(200),
                },
                BedCommand {
                    name: "preset_tv",
                    description: "Preset TV",
                    payload: keeson_frame(0x0000_4000),
                    count: 3,
                    wait: Duration::from_millis(200),
                },
                BedCommand {
                    name: "preset_lounge",
                    description: "Preset Lounge",
                    payload: keeson_frame(0x0000_2000),
                    count: 3,
                    wait: Duration::from_millis(200),
                },
                BedCommand {
                    name: "massage_toggle",
                    description: "Massage Toggle",
                    payload: keeson_frame(0x0100_0000),
                    count: 1,
                    wait: Duration::ZERO,
                },
            ],
        })
    }
}

// ---- Octo ----

const OCTO_NAME_PREFIXES: &[&str] = &["rc2", "octo"];
const OCTO_WRITE_HANDLE: u16 = 0x000e;

fn octo_frame(group: u8, command: u8) -> Vec<u8> {
    vec![0x40, group, command, 0x00, (group ^ command) & 0x7f, 0x40]
}

pub struct OctoVendor;

impl BedVendor for OctoVendor {
    fn manufacturer(&self) -> &'static str {
        "Octo"
    }

    fn is_supported(&self, adv: &BleAdvertisement) -> bool {
        let name = adv.display_name().to_lowercase();
        OCTO_NAME_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    fn plan(&self, adv: &BleAdvertisement) -> Option<ControllerPlan> {
        if !self.is_supported(adv) {
            return None;
        }
        Some(ControllerPlan {
            write_handle: OCTO_WRITE_HANDLE,
            with_response: true,
            commands: vec![
                BedCommand {
                    name: "preset_flat",
                    description: "Preset Flat",
                    payload: octo_frame(0x02, 0x01),
                    count: 1,
                    wait: Duration::ZERO,
                },
                BedCommand {
                    name: "preset_zerog",
                    description: "Preset ZeroG",
                    payload: octo_frame(0x02, 0x02),
                    count: 1,
                    wait: Duration::ZERO,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AddressType;

    fn adv(name: &str) -> BleAdvertisement {
        BleAdvertisement {
            name: Some(name.to_string()),
            address: 1,
            address_type: AddressType::Public,
            rssi: -60,
            manufacturer_data: vec![],
            service_uuids: vec![],
        }
    }

    #[test]
    fn keeson_probe_accepts_known_prefixes() {
        let vendor = KeesonVendor;
        assert!(vendor.is_supported(&adv("KSBT-FDB45C1122AA")));
        assert!(vendor.is_supported(&adv("base-i4.00000123")));
        assert!(!vendor.is_supported(&adv("RC2-something")));
    }

    #[test]
    fn keeson_frame_checksum_complements_sum() {
        let frame = keeson_frame(0x0000_1000);
        assert_eq!(frame.len(), 8);
        let sum: u32 = frame.iter().map(|b| u32::from(*b)).sum();
        assert_eq!(sum & 0xff, 0xff);
    }

    #[test]
    fn plans_carry_repeating_presets() {
        let plan = KeesonVendor.plan(&adv("KSBT-X")).unwrap();
        let zerog = plan
            .commands
            .iter()
            .find(|c| c.name == "preset_zerog")
            .unwrap();
        assert_eq!(zerog.count, 3);
        assert_eq!(zerog.wait, Duration::from_millis(200));
    }

    #[test]
    fn families_resolve() {
        assert_eq!(vendor_for(VendorFamily::Keeson).manufacturer(), "Keeson");
        assert_eq!(vendor_for(VendorFamily::Octo).manufacturer(), "Octo");
    }
}
