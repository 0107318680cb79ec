//! End-to-end vendor setup: discovery, linked-controller failover on a
//! services timeout, entity publication, and the bus-to-BLE command path.

use devkit::fake_proxy::default_services;
use devkit::{adverts, FakeProxy, FakeProxyBehavior, ServicesStep};
use smartbed_bridge::bus::BusHandle;
use smartbed_bridge::config::{BedOptions, VendorFamily};
use smartbed_bridge::health::HealthMonitor;
use smartbed_bridge::models::BleAdvertisement;
use smartbed_bridge::prefs::ConnectPrefs;
use smartbed_bridge::proxy::{ProxyLink, ProxyLinkConfig};
use smartbed_bridge::session::SessionRegistry;
use smartbed_bridge::setup::{run_vendor_setup, SetupDeps};
use smartbed_bridge::stats::ControllerStats;
use smartbed_bridge::vendor::{vendor_for, BedVendor, ControllerPlan, KeesonVendor};
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER_A: u64 = 0xaabb_ccdd_ee01;
const CONTROLLER_B: u64 = 0xaabb_ccdd_ee02;

fn twin_bed() -> BedOptions {
    BedOptions {
        name: "KSBT-AABBCCDDEE01".into(),
        friendly_name: "Master Bed".into(),
        stay_connected: true,
        aliases: Some("KSBT-AABBCCDDEE02".into()),
    }
}

#[tokio::test]
async fn failover_flips_pin_and_commands_reach_the_twin() {
    // A is closer and pinned, but its GATT table never materializes; B is
    // the linked twin that actually works.
    let behavior = FakeProxyBehavior::named("proxy")
        .with_advertisement(adverts::keeson("KSBT-AABBCCDDEE01", CONTROLLER_A, -70))
        .with_advertisement(adverts::keeson("KSBT-AABBCCDDEE02", CONTROLLER_B, -85))
        .with_services_script(
            CONTROLLER_A,
            vec![
                ServicesStep::List(vec![]),
                ServicesStep::List(vec![]),
                ServicesStep::List(vec![]),
            ],
        )
        .with_services_script(CONTROLLER_B, vec![ServicesStep::List(default_services())]);
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ControllerStats::load(dir.path().join("stats.json")));
    stats.pin("KSBT-AABBCCDDEE01", "aabbccddee01");

    let (bus, mut out) = BusHandle::recording("smartbedmqtt");
    let health = HealthMonitor::new(bus.clone(), "keeson", &[]);
    let registry = SessionRegistry::new(Arc::new(ConnectPrefs::load(
        dir.path().join("prefs.json"),
    )));

    let deps = SetupDeps {
        bus: bus.clone(),
        health,
        links: vec![link.clone()],
        registry,
        stats: stats.clone(),
        vendor: vendor_for(VendorFamily::Keeson),
        beds: vec![twin_bed()],
    };

    let setup = run_vendor_setup(&deps).await.unwrap();
    assert_eq!(setup.bed_count(), 1);

    // the pin moved to the controller that completed services discovery
    assert_eq!(
        stats.pinned("KSBT-AABBCCDDEE01").as_deref(),
        Some("aabbccddee02")
    );
    let a_record = stats.record("KSBT-AABBCCDDEE01", "aabbccddee01");
    assert_eq!(a_record.consecutive_failures, 1);

    // entity discovery went out retained, under the stable identity (A's
    // MAC from the config), regardless of which controller won
    let mut config_topics = Vec::new();
    while let Ok(msg) = out.try_recv() {
        if msg.topic.starts_with("homeassistant/") {
            assert!(msg.retain);
            config_topics.push(msg.topic);
        }
    }
    assert!(config_topics
        .iter()
        .any(|t| t == "homeassistant/button/keeson/aabbccddee01_preset_flat/config"));

    // a bus command flows through the pipeline to the selected twin
    bus.route_incoming(
        "smartbedmqtt/keeson/aabbccddee01/preset_flat/command",
        b"PRESS",
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let writes = proxy.state.write_payloads(CONTROLLER_B);
    assert_eq!(writes.len(), 3, "repeating preset should tick three times");
    assert!(proxy.state.write_payloads(CONTROLLER_A).is_empty());

    setup.shutdown();
    link.close().await;
}

/// Probe passes for both twins, but only one yields a controller plan.
struct PlanlessFirstController;

impl BedVendor for PlanlessFirstController {
    fn manufacturer(&self) -> &'static str {
        "Keeson"
    }

    fn is_supported(&self, _adv: &BleAdvertisement) -> bool {
        true
    }

    fn plan(&self, adv: &BleAdvertisement) -> Option<ControllerPlan> {
        if adv.address == CONTROLLER_A {
            None
        } else {
            KeesonVendor.plan(adv)
        }
    }
}

#[tokio::test]
async fn build_failure_is_recorded_and_fails_over_to_the_twin() {
    let behavior = FakeProxyBehavior::named("proxy")
        .with_advertisement(adverts::keeson("KSBT-AABBCCDDEE01", CONTROLLER_A, -70))
        .with_advertisement(adverts::keeson("KSBT-AABBCCDDEE02", CONTROLLER_B, -85));
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ControllerStats::load(dir.path().join("stats.json")));
    let (bus, _out) = BusHandle::recording("smartbedmqtt");
    let health = HealthMonitor::new(bus.clone(), "keeson", &[]);
    let registry = SessionRegistry::new(Arc::new(ConnectPrefs::load(
        dir.path().join("prefs.json"),
    )));

    let deps = SetupDeps {
        bus,
        health,
        links: vec![link.clone()],
        registry,
        stats: stats.clone(),
        vendor: Arc::new(PlanlessFirstController),
        beds: vec![twin_bed()],
    };

    let setup = run_vendor_setup(&deps).await.unwrap();
    assert_eq!(setup.bed_count(), 1);

    // the build failure landed in the persisted ledger for the first twin
    let a_record = stats.record("KSBT-AABBCCDDEE01", "aabbccddee01");
    assert_eq!(a_record.failures, 1);
    assert!(a_record
        .last_error
        .unwrap()
        .contains("produced no controller"));
    // and the working twin was selected and pinned
    assert_eq!(
        stats.pinned("KSBT-AABBCCDDEE01").as_deref(),
        Some("aabbccddee02")
    );
    // the failed build never touched the air
    assert_eq!(proxy.state.connect_count(CONTROLLER_A), 0);

    setup.shutdown();
    link.close().await;
}
