//! Scan behavior across proxy links, including the silent-subscription
//! self-heal.

use devkit::{adverts, FakeProxy, FakeProxyBehavior};
use smartbed_bridge::config::BedOptions;
use smartbed_bridge::discovery::scan_for_beds;
use smartbed_bridge::proxy::{ProxyLink, ProxyLinkConfig};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn bed(name: &str) -> BedOptions {
    BedOptions {
        name: name.into(),
        friendly_name: "Bed".into(),
        stay_connected: false,
        aliases: None,
    }
}

#[tokio::test]
async fn scan_groups_matching_advertisements_by_bed() {
    let behavior = FakeProxyBehavior::named("proxy")
        .with_advertisement(adverts::keeson("KSBT-AABBCCDDEE01", 0xaabb_ccdd_ee01, -70))
        .with_advertisement(adverts::named("SomethingElse", 0x1111_1111_1111, -40));
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();

    let result = scan_for_beds(
        &[link.clone()],
        &[bed("KSBT-AABBCCDDEE01")],
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let candidates = result.matched.get("KSBT-AABBCCDDEE01").unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].advertisement.address, 0xaabb_ccdd_ee01);
    assert_eq!(candidates[0].proxy_host, proxy.host());
    link.close().await;
}

#[tokio::test]
async fn unnamed_advertisement_matches_through_mac_fallback() {
    let behavior =
        FakeProxyBehavior::named("proxy").with_advertisement(adverts::unnamed(0xaabb_ccdd_ee01, -60));
    let proxy = FakeProxy::spawn(behavior).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();

    let result = scan_for_beds(
        &[link.clone()],
        &[bed("AA:BB:CC:DD:EE:01")],
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(result.matched.len(), 1);
    link.close().await;
}

#[tokio::test]
async fn silent_scan_reconnects_links_exactly_once() {
    // a proxy that accepts the subscription but never streams anything
    let proxy = FakeProxy::spawn(FakeProxyBehavior::named("proxy")).await.unwrap();
    let link = ProxyLink::open(ProxyLinkConfig::new(proxy.host(), proxy.port()))
        .await
        .unwrap();
    assert_eq!(proxy.state.hellos.load(Ordering::SeqCst), 1);

    let result = scan_for_beds(&[link.clone()], &[bed("KSBT-X")], Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(result.total_seen, 0);
    // one heal reconnect (second handshake), then the second silent scan
    // just returns to the caller's outer retry
    assert_eq!(proxy.state.hellos.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.state.adv_subscriptions.load(Ordering::SeqCst), 2);
    link.close().await;
}
