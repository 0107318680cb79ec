//! External-system entity discovery.
//!
//! Entities are published under stable identifiers derived from the bed's
//! configured identity, never from the runtime BLE address: which linked
//! controller happened to win failover must not spawn duplicate entities.
//! All entities share the single retained availability topic.

use crate::bus::{BusHandle, STATUS_ONLINE};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Delay before re-publishing discovery after the external system announces
/// itself, so its subscriptions are up first.
pub const REPUBLISH_DEBOUNCE: Duration = Duration::from_secs(15);

/// Lowercased, every non-alphanumeric run collapsed to one underscore.
pub fn safe_id(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// `<safeId(manufacturer)>/<safeId(stableAddress)>`.
pub fn device_topic(manufacturer: &str, stable_address: &str) -> String {
    format!("{}/{}", safe_id(manufacturer), safe_id(stable_address))
}

/// One command entity of a controller (buttons, in practice).
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub component: &'static str,
    /// Stable tag; falls back to the description.
    pub tag: Option<String>,
    pub description: String,
}

impl EntityDescriptor {
    pub fn button(description: impl Into<String>) -> Self {
        Self {
            component: "button",
            tag: None,
            description: description.into(),
        }
    }

    pub fn tag(&self) -> String {
        safe_id(self.tag.as_deref().unwrap_or(&self.description))
    }
}

struct PublishedEntity {
    config_topic: String,
    payload: serde_json::Value,
}

/// Publishes discovery configs and replays them when the external system
/// restarts.
pub struct EntityPublisher {
    bus: BusHandle,
    published: Arc<Mutex<Vec<PublishedEntity>>>,
}

impl EntityPublisher {
    pub fn new(bus: BusHandle) -> Self {
        Self {
            bus,
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publishes one entity's discovery config (retained) and returns the
    /// command topic the entity listens on.
    pub fn publish_entity(
        &self,
        manufacturer: &str,
        stable_address: &str,
        device_name: &str,
        friendly_name: &str,
        entity: &EntityDescriptor,
    ) -> String {
        let device_topic = device_topic(manufacturer, stable_address);
        let tag = entity.tag();
        let config_topic = format!(
            "homeassistant/{}/{}_{}/config",
            entity.component, device_topic, tag
        );
        let command_topic = format!("{}/{}/{}/command", self.bus.ns(), device_topic, tag);
        let unique_id = format!("{}_{}", safe_id(device_name), tag);

        let payload = json!({
            "name": format!("{friendly_name} {}", entity.description),
            "unique_id": unique_id,
            "command_topic": command_topic,
            "availability_topic": self.bus.status_topic(),
            "payload_available": STATUS_ONLINE,
            "payload_not_available": crate::bus::STATUS_OFFLINE,
            "device": {
                "identifiers": [device_topic],
                "name": friendly_name,
                "manufacturer": manufacturer,
            },
        });

        debug!(topic = %config_topic, unique_id = %unique_id, "publishing entity discovery");
        self.bus.publish_json(&config_topic, &payload, true);
        self.published.lock().push(PublishedEntity {
            config_topic,
            payload,
        });
        command_topic
    }

    pub fn republish_all(&self) {
        let published = self.published.lock();
        info!(count = published.len(), "re-publishing entity discovery");
        for entity in published.iter() {
            self.bus.publish_json(&entity.config_topic, &entity.payload, true);
        }
    }

    /// Watches the external system's status topic; `online` triggers a
    /// debounced re-publish of every discovery config.
    pub fn spawn_republish_on_status(&self) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let publisher = Self {
            bus: self.bus.clone(),
            published: self.published.clone(),
        };
        let mut rx = bus.subscribe("homeassistant/status");
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.payload_str().trim() != STATUS_ONLINE {
                    continue;
                }
                debug!("external system online, debouncing discovery re-publish");
                // restart the debounce window on repeated announcements
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(REPUBLISH_DEBOUNCE) => {
                            publisher.republish_all();
                            break;
                        }
                        more = rx.recv() => match more {
                            Some(m) if m.payload_str().trim() == STATUS_ONLINE => continue,
                            Some(_) => continue,
                            None => return,
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHandle;

    #[test]
    fn safe_id_collapses_and_lowercases() {
        assert_eq!(safe_id("Bed One (left)"), "bed_one_left");
        assert_eq!(safe_id("KSBT-FDB45C1122AA"), "ksbt_fdb45c1122aa");
        assert_eq!(safe_id("  weird--name__ "), "weird_name");
    }

    #[test]
    fn device_topic_shape() {
        assert_eq!(device_topic("Keeson", "fdb45c1122aa"), "keeson/fdb45c1122aa");
    }

    #[tokio::test]
    async fn publishes_retained_discovery_with_stable_identifiers() {
        let (bus, mut out) = BusHandle::recording("smartbedmqtt");
        let publisher = EntityPublisher::new(bus);
        let command_topic = publisher.publish_entity(
            "Keeson",
            "fdb45c1122aa",
            "Bed1",
            "Master Bed",
            &EntityDescriptor::button("Preset ZeroG"),
        );

        assert_eq!(
            command_topic,
            "smartbedmqtt/keeson/fdb45c1122aa/preset_zerog/command"
        );

        let msg = out.recv().await.unwrap();
        assert_eq!(
            msg.topic,
            "homeassistant/button/keeson/fdb45c1122aa_preset_zerog/config"
        );
        assert!(msg.retain);
        let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(payload["unique_id"], "bed1_preset_zerog");
        assert_eq!(payload["availability_topic"], "smartbedmqtt/status");
        assert_eq!(payload["command_topic"], command_topic);
        assert_eq!(payload["device"]["identifiers"][0], "keeson/fdb45c1122aa");
    }

    #[tokio::test]
    async fn republish_replays_every_config() {
        let (bus, mut out) = BusHandle::recording("smartbedmqtt");
        let publisher = EntityPublisher::new(bus);
        publisher.publish_entity(
            "Keeson",
            "fdb45c1122aa",
            "Bed1",
            "Bed1",
            &EntityDescriptor::button("Preset Flat"),
        );
        publisher.publish_entity(
            "Keeson",
            "fdb45c1122aa",
            "Bed1",
            "Bed1",
            &EntityDescriptor::button("Preset TV"),
        );
        let _ = out.recv().await;
        let _ = out.recv().await;

        publisher.republish_all();
        let first = out.recv().await.unwrap();
        let second = out.recv().await.unwrap();
        assert!(first.topic.ends_with("_preset_flat/config"));
        assert!(second.topic.ends_with("_preset_tv/config"));
    }
}
