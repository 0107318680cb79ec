//! MQTT surface.
//!
//! Everything above this module talks to a cloneable [`BusHandle`]:
//! publishes go into an unbounded outgoing channel, subscriptions register a
//! topic filter in a shared router. One background task owns the real
//! `rumqttc` client, drains the channel, and routes incoming publishes to
//! whoever subscribed. Tests use [`BusHandle::recording`] to capture the
//! outgoing side without a broker.
//!
//! Availability convention: the retained `<ns>/status` topic is the single
//! source of availability. The last will publishes `offline` retained on
//! ungraceful exit; every broker (re)connect publishes `online` retained.
//! No other code path may publish `offline` while the process is alive.

use crate::config::MqttSettings;
use anyhow::Result;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

struct Route {
    filter: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct BusShared {
    routes: Mutex<Vec<Route>>,
    // filters the eventloop task must subscribe on the broker
    sub_tx: mpsc::UnboundedSender<String>,
}

/// Cloneable handle to the message bus.
#[derive(Clone)]
pub struct BusHandle {
    ns: Arc<String>,
    out_tx: mpsc::UnboundedSender<OutgoingMessage>,
    shared: Arc<BusShared>,
}

impl BusHandle {
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// `<ns>/<suffix>`.
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.ns, suffix)
    }

    pub fn status_topic(&self) -> String {
        self.topic("status")
    }

    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) {
        let msg = OutgoingMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        };
        if self.out_tx.send(msg).is_err() {
            warn!("bus outgoing channel closed, dropping publish");
        }
    }

    pub fn publish_json<T: Serialize>(&self, topic: impl Into<String>, value: &T, retain: bool) {
        match serde_json::to_vec(value) {
            Ok(payload) => self.publish(topic, payload, retain),
            Err(e) => error!(error = %e, "failed to serialize bus payload"),
        }
    }

    /// Registers a topic filter and returns the stream of matching messages.
    pub fn subscribe(&self, filter: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.routes.lock().push(Route {
            filter: filter.to_string(),
            tx,
        });
        // recording handles have no broker side; ignore the closed channel
        let _ = self.shared.sub_tx.send(filter.to_string());
        rx
    }

    /// Delivers an incoming publish to every matching subscriber. Called by
    /// the eventloop task, and directly by tests to simulate broker traffic.
    pub fn route_incoming(&self, topic: &str, payload: &[u8]) {
        let mut routes = self.shared.routes.lock();
        routes.retain(|route| {
            if !topic_matches(&route.filter, topic) {
                return true;
            }
            route
                .tx
                .send(BusMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok()
        });
    }

    /// Detached handle for tests: outgoing messages land in the returned
    /// receiver instead of a broker.
    pub fn recording(ns: &str) -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (sub_tx, _sub_rx) = mpsc::unbounded_channel();
        let handle = Self {
            ns: Arc::new(ns.to_string()),
            out_tx,
            shared: Arc::new(BusShared {
                routes: Mutex::new(Vec::new()),
                sub_tx,
            }),
        };
        (handle, out_rx)
    }
}

/// MQTT topic filter match supporting `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Opens the bus connection and spawns the eventloop task.
///
/// The last will flips `<ns>/status` to `offline` retained on ungraceful
/// exit; the task publishes `online` retained on every ConnAck.
pub async fn connect(
    settings: &MqttSettings,
    ns: &str,
    client_id: &str,
) -> Result<(BusHandle, JoinHandle<()>)> {
    let status_topic = format!("{ns}/status");
    let mut opts = MqttOptions::new(client_id, &settings.host, settings.port);
    opts.set_keep_alive(Duration::from_secs(15));
    if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
        opts.set_credentials(user, password);
    }
    opts.set_last_will(LastWill::new(
        &status_topic,
        STATUS_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<String>();
    let handle = BusHandle {
        ns: Arc::new(ns.to_string()),
        out_tx,
        shared: Arc::new(BusShared {
            routes: Mutex::new(Vec::new()),
            sub_tx,
        }),
    };

    let task_handle = handle.clone();
    let host = settings.host.clone();
    let task = tokio::spawn(async move {
        let mut filters: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!(host = %host, "bus connected");
                        if let Err(e) = client
                            .publish(&status_topic, QoS::AtLeastOnce, true, STATUS_ONLINE)
                            .await
                        {
                            error!(error = %e, "failed to publish online status");
                        }
                        for filter in &filters {
                            if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                                error!(filter = %filter, error = %e, "resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        task_handle.route_incoming(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "bus connection error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                Some(filter) = sub_rx.recv() => {
                    if !filters.contains(&filter) {
                        filters.push(filter.clone());
                    }
                    if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                        error!(filter = %filter, error = %e, "subscribe failed");
                    }
                }
                Some(msg) = out_rx.recv() => {
                    debug!(topic = %msg.topic, retain = msg.retain, "bus publish");
                    if let Err(e) = client
                        .publish(&msg.topic, QoS::AtLeastOnce, msg.retain, msg.payload)
                        .await
                    {
                        error!(topic = %msg.topic, error = %e, "publish failed");
                    }
                }
                else => break,
            }
        }
    });

    Ok((handle, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_filter_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[tokio::test]
    async fn recording_handle_captures_publishes() {
        let (bus, mut out) = BusHandle::recording("smartbedmqtt");
        bus.publish(bus.topic("health"), b"{}".to_vec(), false);
        let msg = out.recv().await.unwrap();
        assert_eq!(msg.topic, "smartbedmqtt/health");
        assert!(!msg.retain);
    }

    #[tokio::test]
    async fn router_delivers_to_matching_subscribers() {
        let (bus, _out) = BusHandle::recording("ns");
        let mut rx = bus.subscribe("ns/proxy/+/status");
        bus.route_incoming("ns/proxy/10.0.0.50/status", b"{\"up\":true}");
        bus.route_incoming("ns/other", b"x");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "ns/proxy/10.0.0.50/status");
        assert!(rx.try_recv().is_err());
    }
}
