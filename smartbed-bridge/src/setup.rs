//! Vendor setup: discovery, candidate ranking, controller build with
//! failover, entity publication, and command wiring.
//!
//! Each bed is set up independently; one unsupported or unreachable bed
//! never blocks the others.

use crate::bus::BusHandle;
use crate::config::BedOptions;
use crate::discovery::{duplicate_identifier_guard, scan_for_beds, Candidate, SCAN_WINDOW};
use crate::entity::EntityPublisher;
use crate::errors::BridgeError;
use crate::health::HealthMonitor;
use crate::pipeline::{Command, CommandPipeline, SessionPort};
use crate::proxy::ProxyLink;
use crate::retry::{retry, RetryPolicy, DISCOVERY_BACKOFF, SETUP_BACKOFF};
use crate::session::SessionRegistry;
use crate::stats::ControllerStats;
use crate::vendor::BedVendor;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct SetupDeps {
    pub bus: BusHandle,
    pub health: HealthMonitor,
    pub links: Vec<Arc<ProxyLink>>,
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<ControllerStats>,
    pub vendor: Arc<dyn BedVendor>,
    pub beds: Vec<BedOptions>,
}

/// Everything the setup spawned; torn down on a supervisor cycle.
#[derive(Default)]
pub struct VendorSetup {
    pipelines: Vec<Arc<CommandPipeline>>,
    tasks: Vec<JoinHandle<()>>,
}

impl VendorSetup {
    pub fn bed_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        // dropping the last pipeline handles aborts their workers
        drop(self.pipelines);
    }
}

pub async fn run_vendor_setup(deps: &SetupDeps) -> Result<VendorSetup> {
    // the tolerant matcher can cross-match shared identifiers; catch that
    // at startup rather than mid-failover
    duplicate_identifier_guard(&deps.beds)?;

    let scan = retry(
        "discovery",
        RetryPolicy::limited(DISCOVERY_BACKOFF, 6),
        |_| true,
        |_, _| {},
        || async {
            let result = scan_for_beds(&deps.links, &deps.beds, SCAN_WINDOW).await?;
            if result.matched.is_empty() {
                anyhow::bail!("no configured beds discovered");
            }
            Ok(result)
        },
    )
    .await?;

    let links_by_host: HashMap<String, Arc<ProxyLink>> = deps
        .links
        .iter()
        .map(|link| (link.host().to_string(), link.clone()))
        .collect();

    let publisher = EntityPublisher::new(deps.bus.clone());
    let mut setup = VendorSetup::default();

    for bed in &deps.beds {
        let Some(candidates) = scan.matched.get(&bed.name) else {
            warn!(bed = %bed.name, "bed not discovered in scan, skipping");
            continue;
        };
        let outcome = retry(
            "bed-setup",
            RetryPolicy::limited(SETUP_BACKOFF, 4),
            |e| {
                e.downcast_ref::<BridgeError>()
                    .map(BridgeError::is_retryable)
                    .unwrap_or(true)
            },
            |_, _| {},
            || setup_bed(deps, &links_by_host, &publisher, bed, candidates),
        )
        .await;
        match outcome {
            Ok((pipeline, tasks)) => {
                info!(bed = %bed.name, "bed ready");
                setup.pipelines.push(pipeline);
                setup.tasks.extend(tasks);
            }
            Err(e) => {
                warn!(bed = %bed.name, error = %format!("{e:#}"), "bed skipped");
            }
        }
    }

    setup.tasks.push(publisher.spawn_republish_on_status());
    Ok(setup)
}

/// Tries each ranked candidate in turn within this one attempt: the pinned
/// controller first while healthy, then by score. A candidate that fails
/// connect or services discovery hands over to its linked twin without
/// backoff.
async fn setup_bed(
    deps: &SetupDeps,
    links_by_host: &HashMap<String, Arc<ProxyLink>>,
    publisher: &EntityPublisher,
    bed: &BedOptions,
    candidates: &[Candidate],
) -> Result<(Arc<CommandPipeline>, Vec<JoinHandle<()>>)> {
    let keyed: Vec<(String, i32)> = candidates
        .iter()
        .map(|c| (c.advertisement.mac_hex(), c.advertisement.rssi))
        .collect();
    let ranked = deps.stats.rank(&bed.name, &keyed);

    for controller_key in ranked {
        let Some(candidate) = candidates
            .iter()
            .find(|c| c.advertisement.mac_hex() == controller_key)
        else {
            continue;
        };
        let adv = &candidate.advertisement;
        if !deps.vendor.is_supported(adv) {
            continue;
        }
        let Some(plan) = deps.vendor.plan(adv) else {
            let err = BridgeError::ControllerBuildFailed(bed.name.clone());
            warn!(bed = %bed.name, controller = %controller_key, error = %err, "candidate build failed, trying next");
            deps.stats
                .record_failure(&bed.name, &controller_key, &err.to_string());
            continue;
        };
        let Some(link) = links_by_host.get(&candidate.proxy_host) else {
            continue;
        };

        let session = deps
            .registry
            .session(link, adv.address, adv.address_type)
            .await;
        if let Err(e) = session.connect().await {
            warn!(bed = %bed.name, controller = %controller_key, error = %format!("{e:#}"), "candidate connect failed, trying next");
            deps.stats
                .record_failure(&bed.name, &controller_key, &format!("{e:#}"));
            continue;
        }
        if let Err(e) = session.services().await {
            warn!(bed = %bed.name, controller = %controller_key, error = %format!("{e:#}"), "candidate services failed, trying next");
            deps.stats
                .record_failure(&bed.name, &controller_key, &format!("{e:#}"));
            continue;
        }

        deps.stats.pin(&bed.name, &controller_key);
        info!(bed = %bed.name, controller = %controller_key, proxy = %candidate.proxy_host, "controller selected");

        let port = SessionPort {
            session,
            bed_name: bed.friendly_name.clone(),
            bed_key: bed.name.clone(),
            controller_key: controller_key.clone(),
            write_handle: plan.write_handle,
            with_response: plan.with_response,
            stay_connected: bed.stay_connected,
        };
        let pipeline = Arc::new(CommandPipeline::spawn(
            port,
            deps.health.clone(),
            deps.stats.clone(),
        ));

        let stable = bed.stable_id();
        let mut tasks = Vec::new();
        for command in &plan.commands {
            let command_topic = publisher.publish_entity(
                deps.vendor.manufacturer(),
                &stable,
                &bed.name,
                &bed.friendly_name,
                &command.entity(),
            );
            let mut rx = deps.bus.subscribe(&command_topic);
            let pipeline = pipeline.clone();
            let queued = Command {
                name: command.name.to_string(),
                payload: command.payload.clone(),
                count: command.count,
                wait: command.wait,
            };
            tasks.push(tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    pipeline.enqueue(queued.clone());
                }
            }));
        }

        return Ok((pipeline, tasks));
    }

    Err(BridgeError::NotSupported(bed.name.clone()).into())
}
