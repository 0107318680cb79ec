//! Proxy link open/authorize behavior against the scripted fake proxy.

use devkit::{FakeProxy, FakeProxyBehavior};
use smartbed_bridge::errors::{parse_name_mismatch, BridgeError};
use smartbed_bridge::proxy::{LinkState, ProxyLink, ProxyLinkConfig};
use smartbed_bridge::retry::{retry, Backoff, RetryPolicy};
use std::time::{Duration, Instant};

#[tokio::test]
async fn open_completes_and_pins_first_presented_name() {
    let proxy = FakeProxy::spawn(FakeProxyBehavior::named("m5stack-atom-lite-fdb45c"))
        .await
        .unwrap();
    let cfg = ProxyLinkConfig::new(proxy.host(), proxy.port());
    let link = ProxyLink::open(cfg).await.unwrap();

    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(
        link.expected_server_name().as_deref(),
        Some("m5stack-atom-lite-fdb45c")
    );
    link.close().await;
}

#[tokio::test]
async fn server_name_mismatch_self_corrects_within_retry_loop() {
    let proxy = FakeProxy::spawn(FakeProxyBehavior::named("m5stack-atom-lite-fdb45c"))
        .await
        .unwrap();
    let cfg = ProxyLinkConfig::new(proxy.host(), proxy.port());
    cfg.pin_server_name("10.0.0.111");

    // first attempt fails with the parseable mismatch shape
    let err = ProxyLink::open(cfg.clone()).await.unwrap_err();
    let message = format!("{err:#}");
    assert!(
        message.contains("Server name mismatch, expected 10.0.0.111, got m5stack-atom-lite-fdb45c"),
        "unexpected error: {message}"
    );
    assert_eq!(
        parse_name_mismatch(&message).as_deref(),
        Some("m5stack-atom-lite-fdb45c")
    );

    // the supervisor's outer retry pins the presented name and tries again
    let link = retry(
        "proxy-open",
        RetryPolicy::limited(
            Backoff::new(Duration::from_millis(10), Duration::from_millis(10), 1.0),
            3,
        ),
        |_| true,
        |_, e| {
            if let Some(BridgeError::NameMismatch { presented, .. }) =
                e.downcast_ref::<BridgeError>()
            {
                cfg.pin_server_name(presented);
            }
        },
        || ProxyLink::open(cfg.clone()),
    )
    .await
    .unwrap();

    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(
        link.expected_server_name().as_deref(),
        Some("m5stack-atom-lite-fdb45c")
    );
    // one failed handshake plus two successful-path handshakes
    assert!(proxy.state.hellos.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    link.close().await;
}

#[tokio::test]
async fn missing_ble_proxy_feature_flags_rejects_open() {
    let mut behavior = FakeProxyBehavior::named("plain-esphome-node");
    behavior.feature_flags = 0;
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let err = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("BLE-proxy feature flags"));
}

#[tokio::test]
async fn wrong_password_is_not_authorized() {
    let mut behavior = FakeProxyBehavior::named("proxy");
    behavior.password = Some("secret".into());
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let mut cfg = ProxyLinkConfig::new(proxy.host(), proxy.port());
    cfg.password = Some("wrong".into());
    let err = ProxyLink::open(cfg).await.unwrap_err();
    assert!(format!("{err:#}").contains("not authorized"));
}

#[tokio::test]
async fn readiness_gate_expires_as_api_not_ready() {
    let proxy = FakeProxy::spawn(FakeProxyBehavior::named("proxy")).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();

    proxy.kill();
    // give the link a moment to notice the dead socket
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let err = link.await_ready().await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(
        matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::ApiNotReady(_))
        ),
        "unexpected error: {err:#}"
    );
    assert!(elapsed >= Duration::from_millis(4500), "gate fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "gate fired late: {elapsed:?}");
    link.close().await;
}
