//! Persisted per-(bed, controller) success/failure accounting and the
//! failover scorer.
//!
//! Beds with two linked controllers advertise both; the scorer ranks the
//! candidates by RSSI shaped with persisted history, and the pinned
//! controller stays first as long as it is not currently failing (sticky
//! selection).

use crate::prefs::write_json_atomic;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

const ERROR_SNIPPET_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRecord {
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Rolling window of failure timestamps, trimmed to the last 24 h.
    #[serde(default)]
    pub recent_failure_ats: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_controller: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BedRecord {
    #[serde(rename = "_meta", default)]
    pub meta: BedMeta,
    #[serde(default)]
    pub controllers: HashMap<String, ControllerRecord>,
}

pub struct ControllerStats {
    path: PathBuf,
    map: Mutex<HashMap<String, BedRecord>>,
}

impl ControllerStats {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "controller stats unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    pub fn record_success(&self, bed: &str, controller: &str) {
        {
            let mut map = self.map.lock();
            let record = map
                .entry(bed.to_string())
                .or_default()
                .controllers
                .entry(controller.to_string())
                .or_default();
            record.successes += 1;
            record.consecutive_failures = 0;
            record.last_success_at = Some(Utc::now());
        }
        self.save();
    }

    pub fn record_failure(&self, bed: &str, controller: &str, error: &str) {
        let now = Utc::now();
        {
            let mut map = self.map.lock();
            let record = map
                .entry(bed.to_string())
                .or_default()
                .controllers
                .entry(controller.to_string())
                .or_default();
            record.failures += 1;
            record.consecutive_failures += 1;
            record.last_failure_at = Some(now);
            record.last_error = Some(truncate(error, ERROR_SNIPPET_LIMIT));
            record.recent_failure_ats.push(now);
            let floor = now - ChronoDuration::hours(24);
            record.recent_failure_ats.retain(|at| *at > floor);
        }
        self.save();
    }

    pub fn pin(&self, bed: &str, controller: &str) {
        {
            let mut map = self.map.lock();
            let entry = map.entry(bed.to_string()).or_default();
            if entry.meta.pinned_controller.as_deref() == Some(controller) {
                return;
            }
            entry.meta.pinned_controller = Some(controller.to_string());
        }
        debug!(bed, controller, "pinned controller");
        self.save();
    }

    pub fn pinned(&self, bed: &str) -> Option<String> {
        self.map
            .lock()
            .get(bed)
            .and_then(|r| r.meta.pinned_controller.clone())
    }

    pub fn record(&self, bed: &str, controller: &str) -> ControllerRecord {
        self.map
            .lock()
            .get(bed)
            .and_then(|r| r.controllers.get(controller))
            .cloned()
            .unwrap_or_default()
    }

    /// Orders controller candidates best-first: score-sorted, with the
    /// pinned controller promoted when its streak is still healthy.
    pub fn rank(&self, bed: &str, candidates: &[(String, i32)]) -> Vec<String> {
        let now = Utc::now();
        let mut scored: Vec<(String, i64)> = candidates
            .iter()
            .map(|(key, rssi)| {
                let record = self.record(bed, key);
                (key.clone(), score(&record, *rssi, now))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        let mut ordered: Vec<String> = scored.into_iter().map(|(key, _)| key).collect();

        if let Some(pinned) = self.pinned(bed) {
            let healthy = self.record(bed, &pinned).consecutive_failures < 2;
            if healthy {
                if let Some(idx) = ordered.iter().position(|k| *k == pinned) {
                    let pinned = ordered.remove(idx);
                    ordered.insert(0, pinned);
                }
            }
        }
        ordered
    }

    fn save(&self) {
        let snapshot = self.map.lock().clone();
        if let Err(e) = write_json_atomic(&self.path, &snapshot) {
            warn!(error = %format!("{e:#}"), "failed to persist controller stats");
        }
    }
}

/// rssi + success recency bonus - consecutive-failure penalty - chronic
/// penalty - recent hourly penalty.
pub fn score(record: &ControllerRecord, rssi: i32, now: DateTime<Utc>) -> i64 {
    let recency_bonus = match record.last_success_at {
        Some(at) if now - at <= ChronoDuration::hours(6) => 60,
        Some(at) if now - at <= ChronoDuration::hours(24) => 25,
        _ => 0,
    };
    let failure_penalty = (i64::from(record.consecutive_failures) * 30).min(90);
    let chronic_penalty = if record.failures > record.successes + 2 {
        15
    } else {
        0
    };
    let hour_floor = now - ChronoDuration::hours(1);
    let failures_last_hour = record
        .recent_failure_ats
        .iter()
        .filter(|at| **at > hour_floor)
        .count() as i64;
    let hourly_penalty = (failures_last_hour * 10).min(40);

    i64::from(rssi) + recency_bonus - failure_penalty - chronic_penalty - hourly_penalty
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text[..cut].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> (tempfile::TempDir, ControllerStats) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartbed-mqtt-keeson-controller-preferences.json");
        (dir, ControllerStats::load(path))
    }

    #[test]
    fn failing_candidate_never_outranks_clean_one_at_equal_rssi() {
        let now = Utc::now();
        let clean = ControllerRecord::default();
        for consecutive_failures in 2..6u32 {
            let failing = ControllerRecord {
                failures: u64::from(consecutive_failures),
                consecutive_failures,
                recent_failure_ats: vec![now],
                ..Default::default()
            };
            assert!(
                score(&failing, -70, now) < score(&clean, -70, now),
                "streak {consecutive_failures} scored too high"
            );
        }
    }

    #[test]
    fn recency_bonus_tiers() {
        let now = Utc::now();
        let fresh = ControllerRecord {
            last_success_at: Some(now - ChronoDuration::hours(1)),
            ..Default::default()
        };
        let day_old = ControllerRecord {
            last_success_at: Some(now - ChronoDuration::hours(12)),
            ..Default::default()
        };
        let stale = ControllerRecord {
            last_success_at: Some(now - ChronoDuration::hours(48)),
            ..Default::default()
        };
        assert_eq!(score(&fresh, 0, now), 60);
        assert_eq!(score(&day_old, 0, now), 25);
        assert_eq!(score(&stale, 0, now), 0);
    }

    #[test]
    fn penalties_are_capped() {
        let now = Utc::now();
        let record = ControllerRecord {
            failures: 50,
            successes: 0,
            consecutive_failures: 10,
            recent_failure_ats: (0..10).map(|_| now).collect(),
            ..Default::default()
        };
        // -90 consecutive cap, -15 chronic, -40 hourly cap
        assert_eq!(score(&record, 0, now), -145);
    }

    #[test]
    fn sticky_pinned_controller_leads_while_healthy() {
        let (_dir, stats) = stats();
        stats.record_success("Bed1", "aaa");
        stats.record_success("Bed1", "bbb");
        stats.pin("Bed1", "bbb");
        let ranked = stats.rank(
            "Bed1",
            &[("aaa".into(), -60), ("bbb".into(), -85)],
        );
        assert_eq!(ranked[0], "bbb");

        // two consecutive failures break the stickiness
        stats.record_failure("Bed1", "bbb", "timeout");
        stats.record_failure("Bed1", "bbb", "timeout");
        let ranked = stats.rank(
            "Bed1",
            &[("aaa".into(), -60), ("bbb".into(), -85)],
        );
        assert_eq!(ranked[0], "aaa");
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        {
            let stats = ControllerStats::load(&path);
            stats.record_failure("Bed1", "aaa", "gatt timeout");
            stats.pin("Bed1", "aaa");
        }
        let stats = ControllerStats::load(&path);
        let record = stats.record("Bed1", "aaa");
        assert_eq!(record.failures, 1);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.last_error.as_deref(), Some("gatt timeout"));
        assert_eq!(stats.pinned("Bed1").as_deref(), Some("aaa"));
    }

    #[test]
    fn success_resets_streak() {
        let (_dir, stats) = stats();
        stats.record_failure("Bed1", "aaa", "x");
        stats.record_failure("Bed1", "aaa", "x");
        stats.record_success("Bed1", "aaa");
        let record = stats.record("Bed1", "aaa");
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.failures, 2);
        assert_eq!(record.successes, 1);
    }

    #[test]
    fn error_snippets_are_bounded() {
        let (_dir, stats) = stats();
        let long = "x".repeat(2000);
        stats.record_failure("Bed1", "aaa", &long);
        assert_eq!(
            stats.record("Bed1", "aaa").last_error.unwrap().len(),
            ERROR_SNIPPET_LIMIT
        );
    }
}
