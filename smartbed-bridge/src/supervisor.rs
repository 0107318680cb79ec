//! Outer life cycle: bus, health monitor, proxy fleet, vendor setup, and
//! the restart-on-signal loop.
//!
//! One iteration wires everything, then parks on the health monitor's
//! restart signal. Cycling closes the proxy links first and waits a beat so
//! each proxy releases its single API-subscriber slot before the next
//! iteration dials back in.

use crate::bus;
use crate::config::{DiscoveredBroker, Options};
use crate::errors::{is_socket_or_ble, parse_name_mismatch, BridgeError};
use crate::health::HealthMonitor;
use crate::prefs::ConnectPrefs;
use crate::proxy::{ProxyLink, ProxyLinkConfig};
use crate::ratelimit::RateLimitedLog;
use crate::retry::{retry, RetryPolicy, PROXY_OPEN_BACKOFF};
use crate::session::SessionRegistry;
use crate::setup::{run_vendor_setup, SetupDeps};
use crate::stats::ControllerStats;
use crate::vendor::vendor_for;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause between closing the links and redialing, so the proxy drops the
/// old subscriber slot.
const SLOT_RELEASE_PAUSE: Duration = Duration::from_secs(1);

/// Broker coordinates discovered by the launcher, exported as environment
/// variables for the process.
pub fn discovered_broker_from_env() -> DiscoveredBroker {
    DiscoveredBroker {
        host: std::env::var("MQTT_HOST").ok(),
        port: std::env::var("MQTT_PORT").ok().and_then(|p| p.parse().ok()),
        user: std::env::var("MQTT_USER").ok(),
        password: std::env::var("MQTT_PASSWORD").ok(),
    }
}

pub async fn run(options: Options) -> Result<()> {
    let settings = options.mqtt_settings(&discovered_broker_from_env())?;
    info!(host = %settings.host, port = settings.port, "bridge starting");

    let prefs = Arc::new(ConnectPrefs::load(
        options
            .data_dir
            .join(format!("{}-ble-preferences.json", options.name)),
    ));
    let stats = Arc::new(ControllerStats::load(options.data_dir.join(format!(
        "{}-{}-controller-preferences.json",
        options.name,
        options.family.as_str()
    ))));
    let registry = SessionRegistry::new(prefs);
    let vendor = vendor_for(options.family);
    let proxy_cfgs: Vec<ProxyLinkConfig> = options
        .ble_proxies
        .iter()
        .map(ProxyLinkConfig::from_options)
        .collect();
    let proxy_hosts: Vec<String> = options.ble_proxies.iter().map(|p| p.host.clone()).collect();
    let limiter = RateLimitedLog::default();

    loop {
        let (bus, bus_task) = bus::connect(&settings, &options.root_topic, &options.name).await?;
        let health = HealthMonitor::new(bus.clone(), options.family.as_str(), &proxy_hosts);

        let cycle = run_cycle(
            &options,
            &bus,
            &health,
            &proxy_cfgs,
            &registry,
            &stats,
            &vendor,
            &limiter,
        )
        .await;

        match cycle {
            Ok(()) => {
                // restart signal consumed; tear down and loop
                health.shutdown();
                tokio::time::sleep(SLOT_RELEASE_PAUSE).await;
                bus_task.abort();
            }
            Err(e) => {
                if is_socket_or_ble(&e) {
                    // publish a final snapshot before the coded exit, and
                    // give the eventloop a beat to flush it
                    health.publish_final_snapshot();
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                health.shutdown();
                bus_task.abort();
                return Err(e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    options: &Options,
    bus: &bus::BusHandle,
    health: &HealthMonitor,
    proxy_cfgs: &[ProxyLinkConfig],
    registry: &Arc<SessionRegistry>,
    stats: &Arc<ControllerStats>,
    vendor: &Arc<dyn crate::vendor::BedVendor>,
    limiter: &RateLimitedLog,
) -> Result<()> {
    // open every proxy link; infinite retry with the server-name
    // self-correction in the retry callback
    let mut links = Vec::new();
    for cfg in proxy_cfgs {
        let link = retry(
            "proxy-open",
            RetryPolicy::forever(PROXY_OPEN_BACKOFF),
            |e| is_socket_or_ble(e),
            |_, e| {
                if let Some(BridgeError::NameMismatch { presented, .. }) =
                    e.downcast_ref::<BridgeError>()
                {
                    if limiter.should_log(&format!("name-mismatch:{}", cfg.host)) {
                        warn!(host = %cfg.host, presented = %presented, "server name mismatch, pinning presented name");
                    }
                    cfg.pin_server_name(presented);
                } else if let Some(presented) = parse_name_mismatch(&format!("{e:#}")) {
                    cfg.pin_server_name(&presented);
                }
            },
            || ProxyLink::open(cfg.clone()),
        )
        .await?;
        links.push(link);
    }

    let deps = SetupDeps {
        bus: bus.clone(),
        health: health.clone(),
        links: links.clone(),
        registry: registry.clone(),
        stats: stats.clone(),
        vendor: vendor.clone(),
        beds: options.beds.clone(),
    };

    // run setup while staying responsive to restart requests (a wedged
    // setup must not block the maintenance reconnect)
    let setup_fut = run_vendor_setup(&deps);
    tokio::pin!(setup_fut);
    let mut setup_handle = None;
    let request = tokio::select! {
        request = health.wait_for_restart() => request,
        result = &mut setup_fut => {
            match result {
                Ok(handle) => {
                    info!(beds = handle.bed_count(), "vendor setup complete");
                    setup_handle = Some(handle);
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "vendor setup failed; waiting for restart signal");
                }
            }
            health.wait_for_restart().await
        }
    };

    info!(kind = %request.kind, reason = %request.reason, "restart requested, cycling connections");

    if let Some(handle) = setup_handle {
        handle.shutdown();
    }
    for link in &links {
        link.close().await;
    }
    Ok(())
}
