//! Persisted per-device connect-mode preference.
//!
//! File shape: `{ "<proxyHost>:<address>": { "withoutCache": bool } }`,
//! rewritten atomically (write-tmp + rename) on every meaningful change so
//! a crash mid-write cannot corrupt the map.

use crate::models::DeviceKey;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePref {
    pub without_cache: bool,
}

pub struct ConnectPrefs {
    path: PathBuf,
    map: Mutex<HashMap<String, DevicePref>>,
}

impl ConnectPrefs {
    /// Loads the store, tolerating a missing or unreadable file (the proxy
    /// fleet must come up even when /data was wiped).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "connect preferences unreadable, starting empty");
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

    fn key(key: &DeviceKey) -> String {
        format!("{}:{}", key.proxy_host, key.address)
    }

    pub fn without_cache(&self, key: &DeviceKey) -> Option<bool> {
        self.map.lock().get(&Self::key(key)).map(|p| p.without_cache)
    }

    /// Records the preferred connect mode; no-op when unchanged.
    pub fn set_without_cache(&self, key: &DeviceKey, without_cache: bool) {
        {
            let mut map = self.map.lock();
            let entry = map.insert(Self::key(key), DevicePref { without_cache });
            if entry.map(|p| p.without_cache) == Some(without_cache) {
                return;
            }
        }
        debug!(device = %key, without_cache, "persisting connect preference");
        if let Err(e) = self.save() {
            warn!(error = %format!("{e:#}"), "failed to persist connect preferences");
        }
    }

    fn save(&self) -> Result<()> {
        let snapshot = self.map.lock().clone();
        write_json_atomic(&self.path, &snapshot)
    }
}

/// All-or-nothing JSON write: serialize to `<path>.tmp`, then rename over
/// the target.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartbed-mqtt-ble-preferences.json");
        let key = DeviceKey::new("10.0.0.50", 0xfdb4_5c11_22aa);

        let prefs = ConnectPrefs::load(&path);
        assert_eq!(prefs.without_cache(&key), None);
        prefs.set_without_cache(&key, true);

        let reloaded = ConnectPrefs::load(&path);
        assert_eq!(reloaded.without_cache(&key), Some(true));
        // no stray tmp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = ConnectPrefs::load(dir.path().join("nope.json"));
        assert_eq!(prefs.without_cache(&DeviceKey::new("h", 1)), None);
    }

    #[test]
    fn key_shape_matches_convention() {
        assert_eq!(
            ConnectPrefs::key(&DeviceKey::new("10.0.0.50", 42)),
            "10.0.0.50:42"
        );
    }
}
