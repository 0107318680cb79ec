//! Advertisement scanning and tolerant identifier matching.
//!
//! Bed names in the wild are messy: some configs carry the controller's
//! advertised name, some a MAC with separators, some a marketing alias. The
//! normalizer expands every configured token into the forms worth matching,
//! and the predicate accepts prefix/suffix and bounded substring matches on
//! top of exact ones.

use crate::config::BedOptions;
use crate::errors::BridgeError;
use crate::models::BleAdvertisement;
use crate::proxy::ProxyLink;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub const SCAN_WINDOW: Duration = Duration::from_secs(30);

/// Extracts the first run of exactly 12 hex characters found in the token
/// (ignoring separators), lowercased.
pub fn extract_hex12(token: &str) -> Option<String> {
    let stripped: String = token
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    if stripped.len() == 12 {
        return Some(stripped);
    }
    // first 12-hex substring anywhere in the raw token
    let lower = token.to_lowercase();
    let bytes = lower.as_bytes();
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_hexdigit() {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == 12 {
                let next_is_hex = bytes
                    .get(i + 1)
                    .map(|n| n.is_ascii_hexdigit())
                    .unwrap_or(false);
                if !next_is_hex {
                    return Some(lower[run_start..=i].to_string());
                }
                // longer hex run, skip past it
                run_len = 0;
            }
        } else {
            run_len = 0;
        }
    }
    None
}

/// Normalized match forms for one configured token. Idempotent: feeding an
/// output back in yields the same set.
pub fn normalize(token: &str) -> Vec<String> {
    let mut forms = Vec::new();
    let base = token.trim().to_lowercase();
    if base.is_empty() {
        return forms;
    }
    forms.push(base.clone());
    if let Some(hex) = extract_hex12(&base) {
        if !forms.contains(&hex) {
            forms.push(hex);
        }
    }
    forms
}

/// All normalized identifier forms of a bed config.
pub fn bed_identifiers(bed: &BedOptions) -> Vec<String> {
    let mut out = Vec::new();
    for token in bed.identifier_tokens() {
        for form in normalize(&token) {
            if !out.contains(&form) {
                out.push(form);
            }
        }
    }
    out
}

/// Startup guard: the substring tolerance below can cross-match beds that
/// share an identifier, so duplicates are fatal for the vendor setup.
pub fn duplicate_identifier_guard(beds: &[BedOptions]) -> Result<()> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for bed in beds {
        for id in bed_identifiers(bed) {
            if let Some(first) = owners.get(id.as_str()) {
                if *first != bed.name {
                    return Err(BridgeError::DuplicateIdentifier {
                        identifier: id,
                        first: (*first).to_string(),
                        second: bed.name.clone(),
                    }
                    .into());
                }
            } else {
                owners.insert(id, &bed.name);
            }
        }
    }
    Ok(())
}

/// Minimum substring length for the tolerant match; one more when the token
/// starts with the vendor's stray leading "b".
fn substring_min_len(id: &str) -> usize {
    if id.starts_with('b') {
        7
    } else {
        6
    }
}

/// Whether one normalized identifier accepts an advertisement with the
/// given lowercased name and 12-hex MAC.
pub fn identifier_matches(id: &str, name: &str, mac_hex: &str) -> bool {
    if id == name || id == mac_hex {
        return true;
    }
    if let Some(hex) = extract_hex12(id) {
        if hex == mac_hex || hex == name {
            return true;
        }
    }
    if !name.is_empty() && (name.starts_with(id) || name.ends_with(id) || id.starts_with(name) || id.ends_with(name)) {
        return true;
    }
    if id.len() >= substring_min_len(id) && !name.is_empty() && name.contains(id) {
        return true;
    }
    false
}

/// One matched candidate: the advertisement plus the proxy that heard it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub advertisement: BleAdvertisement,
    pub proxy_host: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Candidates grouped by bed name.
    pub matched: HashMap<String, Vec<Candidate>>,
    /// Total distinct advertisements seen across all proxies.
    pub total_seen: usize,
}

struct BedProgress {
    name: String,
    remaining: HashSet<String>,
}

/// Scans all proxy links for up to the scan window, matching advertisements
/// against every bed's identifiers. De-duplicates by (proxy, address)
/// within the scan. Completes early once every identifier of every bed has
/// been consumed.
///
/// Silent-subscription self-heal: a window that ends with zero
/// advertisements across all links triggers exactly one full link
/// reconnect and a second scan; a second silent window is left to the
/// caller's outer retry.
pub async fn scan_for_beds(
    links: &[Arc<ProxyLink>],
    beds: &[BedOptions],
    window: Duration,
) -> Result<ScanResult> {
    let mut reconnected = false;
    loop {
        let result = scan_once(links, beds, window).await?;
        if result.total_seen == 0 && !reconnected {
            warn!("Scan timed out with 0 advertisements seen");
            for link in links {
                if let Err(e) = link.reconnect().await {
                    warn!(host = link.host(), error = %format!("{e:#}"), "silent-scan reconnect failed");
                }
            }
            reconnected = true;
            continue;
        }
        return Ok(result);
    }
}

async fn scan_once(
    links: &[Arc<ProxyLink>],
    beds: &[BedOptions],
    window: Duration,
) -> Result<ScanResult> {
    // merge every link's advertisement stream into one channel
    let (merged_tx, mut merged_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut forwarders = Vec::new();
    for link in links {
        match link.subscribe_advertisements().await {
            Ok(mut rx) => {
                let tx = merged_tx.clone();
                let host = link.host().to_string();
                forwarders.push(tokio::spawn(async move {
                    while let Some(adv) = rx.recv().await {
                        if tx.send((host.clone(), adv)).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => {
                warn!(host = link.host(), error = %format!("{e:#}"), "advertisement subscription failed")
            }
        }
    }
    drop(merged_tx);

    let mut progress: Vec<BedProgress> = beds
        .iter()
        .map(|bed| BedProgress {
            name: bed.name.clone(),
            remaining: bed_identifiers(bed).into_iter().collect(),
        })
        .collect();

    let mut result = ScanResult::default();
    let mut seen: HashSet<(String, u64)> = HashSet::new();
    let deadline = Instant::now() + window;

    loop {
        if progress.iter().all(|p| p.remaining.is_empty()) {
            debug!("all configured identifiers consumed, ending scan early");
            break;
        }
        let item = tokio::select! {
            _ = sleep_until(deadline) => break,
            item = merged_rx.recv() => item,
        };
        let Some((host, adv)) = item else { break };
        if !seen.insert((host.clone(), adv.address)) {
            continue;
        }
        result.total_seen += 1;
        record_matches(&mut progress, &mut result, &host, &adv);
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    for link in links {
        link.unsubscribe_advertisements();
    }

    info!(
        seen = result.total_seen,
        matched = result.matched.len(),
        "scan finished"
    );
    Ok(result)
}

/// Applies the match predicate. When an advertisement satisfies any
/// identifier of a bed, every identifier of that bed satisfied by the same
/// advertisement is consumed, otherwise completion never fires even though
/// discovery is logically done.
fn record_matches(
    progress: &mut [BedProgress],
    result: &mut ScanResult,
    proxy_host: &str,
    adv: &BleAdvertisement,
) {
    let name = adv
        .name
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    let mac_hex = adv.mac_hex();
    for bed in progress.iter_mut() {
        let satisfied: Vec<String> = bed
            .remaining
            .iter()
            .filter(|id| identifier_matches(id, &name, &mac_hex))
            .cloned()
            .collect();
        if satisfied.is_empty() {
            continue;
        }
        for id in &satisfied {
            bed.remaining.remove(id);
        }
        debug!(bed = %bed.name, device = %adv.display_name(), rssi = adv.rssi, "advertisement matched");
        result
            .matched
            .entry(bed.name.clone())
            .or_default()
            .push(Candidate {
                advertisement: adv.clone(),
                proxy_host: proxy_host.to_string(),
            });
    }
}
