//! Device session behavior: the global connect mutex, cache-mode learning,
//! the services recovery ladder, and the proxy-log side channel.

use devkit::fake_proxy::default_services;
use devkit::{ConnectStep, FakeProxy, FakeProxyBehavior, ServicesStep};
use smartbed_bridge::errors::BridgeError;
use smartbed_bridge::models::{AddressType, DeviceKey};
use smartbed_bridge::prefs::ConnectPrefs;
use smartbed_bridge::proxy::wire::device_request_type;
use smartbed_bridge::proxy::{ProxyLink, ProxyLinkConfig};
use smartbed_bridge::session::SessionRegistry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ADDRESS: u64 = 0xaabb_ccdd_ee01;

struct Fixture {
    proxy: FakeProxy,
    link: Arc<ProxyLink>,
    registry: Arc<SessionRegistry>,
    prefs_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn fixture(behavior: FakeProxyBehavior) -> Fixture {
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let prefs_path = dir.path().join("ble-preferences.json");
    let registry = SessionRegistry::new(Arc::new(ConnectPrefs::load(&prefs_path)));
    Fixture {
        proxy,
        link,
        registry,
        prefs_path,
        _dir: dir,
    }
}

fn device_key(fixture: &Fixture) -> DeviceKey {
    DeviceKey::new(fixture.proxy.host(), ADDRESS)
}

#[tokio::test]
async fn overlapping_connects_are_serialized_by_the_global_mutex() {
    let mut behavior = FakeProxyBehavior::named("proxy");
    behavior.connect_delay = Duration::from_millis(200);
    let fx = fixture(behavior).await;

    let first = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;
    let second = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;

    let (a, b) = tokio::join!(first.connect(), second.connect());
    // if connects overlapped, one waiter would observe a reset pending slot
    a.unwrap();
    b.unwrap();
    assert_eq!(fx.proxy.state.connect_count(ADDRESS), 2);
}

#[tokio::test]
async fn failed_default_mode_flips_to_without_cache_and_persists() {
    let behavior = FakeProxyBehavior::named("proxy").with_connect_script(
        ADDRESS,
        vec![
            ConnectStep::Fail { error: 133 },
            ConnectStep::Success { mtu: Some(247) },
        ],
    );
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;

    session.connect().await.unwrap();

    let connects = fx.proxy.state.connects.lock().clone();
    assert_eq!(
        connects,
        vec![
            (ADDRESS, device_request_type::CONNECT_WITH_CACHE),
            (ADDRESS, device_request_type::CONNECT_WITHOUT_CACHE),
        ]
    );
    // the failed attempt ran the cleanup pass
    assert_eq!(fx.proxy.state.clear_cache_requests.load(Ordering::SeqCst), 1);
    // the learned mode survives a store reload
    let reloaded = ConnectPrefs::load(&fx.prefs_path);
    assert_eq!(reloaded.without_cache(&device_key(&fx)), Some(true));
}

#[tokio::test]
async fn empty_services_recover_through_cache_clear_ladder() {
    let behavior = FakeProxyBehavior::named("proxy").with_services_script(
        ADDRESS,
        vec![
            ServicesStep::List(vec![]),
            ServicesStep::List(vec![]),
            ServicesStep::List(default_services()),
        ],
    );
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;
    session.connect().await.unwrap();

    let services = session.services().await.unwrap();
    assert!(!services.is_empty());
    assert_eq!(services[0].characteristics[0].handle, 0x0012);

    // the ladder cleared the cache, disconnected, and reconnected without cache
    assert_eq!(fx.proxy.state.clear_cache_requests.load(Ordering::SeqCst), 1);
    assert!(fx.proxy.state.disconnects.lock().contains(&ADDRESS));
    let connects = fx.proxy.state.connects.lock().clone();
    assert_eq!(
        connects.last(),
        Some(&(ADDRESS, device_request_type::CONNECT_WITHOUT_CACHE))
    );
    // recovery via the ladder persists the without-cache preference
    let reloaded = ConnectPrefs::load(&fx.prefs_path);
    assert_eq!(reloaded.without_cache(&device_key(&fx)), Some(true));
}

#[tokio::test]
async fn ignored_connects_abort_fast_and_arm_force_without_cache() {
    let behavior = FakeProxyBehavior::named("proxy").with_connect_script(
        ADDRESS,
        vec![
            ConnectStep::IgnoredLog { state: "CONNECTING" },
            ConnectStep::IgnoredLog { state: "CONNECTING" },
        ],
    );
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;

    let started = Instant::now();
    let err = session.connect().await.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::ProxyIgnored(_))
        ),
        "unexpected error: {err:#}"
    );
    // side channel short-circuits well before the 12 s attempt timeout
    assert!(started.elapsed() < Duration::from_secs(5));

    let diag = session.diagnostics();
    assert_eq!(diag.ignored_connects, 2);
    assert!(diag.force_without_cache_until.is_some());
}

#[tokio::test]
async fn established_log_line_counts_as_connected() {
    let behavior = FakeProxyBehavior::named("proxy").with_connect_script(
        ADDRESS,
        vec![ConnectStep::IgnoredLog {
            state: "ESTABLISHED",
        }],
    );
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;

    session.connect().await.unwrap();
    assert!(session.is_connected());
}

#[tokio::test]
async fn notify_subscription_delivers_data_and_resubscribes_idempotently() {
    let mut behavior = FakeProxyBehavior::named("proxy");
    behavior
        .notify_data
        .insert((ADDRESS, 0x0015), vec![0x01, 0x02, 0x03]);
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;
    session.connect().await.unwrap();

    let mut first = session.subscribe_notify(0x0015).await.unwrap();
    assert_eq!(first.recv().await.unwrap(), vec![0x01, 0x02, 0x03]);

    // replacing the listener deregisters the prior one: the old stream ends
    let mut second = session.subscribe_notify(0x0015).await.unwrap();
    assert_eq!(second.recv().await.unwrap(), vec![0x01, 0x02, 0x03]);
    assert!(first.recv().await.is_none());
}

#[tokio::test]
async fn hard_failure_log_sets_cooldown() {
    let behavior = FakeProxyBehavior::named("proxy").with_connect_script(
        ADDRESS,
        vec![ConnectStep::HardFailureLog, ConnectStep::HardFailureLog],
    );
    let fx = fixture(behavior).await;
    let session = fx
        .registry
        .session(&fx.link, ADDRESS, AddressType::Public)
        .await;

    let err = session.connect().await.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::HardFailure(_))
        ),
        "unexpected error: {err:#}"
    );
    assert!(session.diagnostics().cooldown_until.is_some());
}
