//! Startup configuration.
//!
//! Loaded once from the add-on's `options.json` (path overridable through
//! the `SMARTBED_CONFIG` environment variable) and validated against the
//! serde schema below. `<auto_detect>` placeholders in the MQTT settings are
//! resolved with the launcher's discovery rules.

use crate::discovery::extract_hex12;
use crate::errors::BridgeError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const AUTO_DETECT: &str = "<auto_detect>";
pub const DEFAULT_ROOT_TOPIC: &str = "smartbedmqtt";
pub const DEFAULT_PROXY_PORT: u16 = 6053;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorFamily {
    Keeson,
    Octo,
}

impl VendorFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorFamily::Keeson => "keeson",
            VendorFamily::Octo => "octo",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    pub mqtt_host: String,
    pub mqtt_port: String,
    #[serde(default)]
    pub mqtt_user: String,
    #[serde(default)]
    pub mqtt_password: String,
    /// Vendor family selector.
    #[serde(rename = "type")]
    pub family: VendorFamily,
    #[serde(default)]
    pub ble_proxies: Vec<ProxyOptions>,
    #[serde(default)]
    pub beds: Vec<BedOptions>,
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_root_topic() -> String {
    DEFAULT_ROOT_TOPIC.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_name() -> String {
    "smartbed-mqtt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyOptions {
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    pub password: Option<String>,
    pub encryption_key: Option<String>,
    pub expected_server_name: Option<String>,
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BedOptions {
    pub name: String,
    pub friendly_name: String,
    #[serde(default)]
    pub stay_connected: bool,
    /// Free-form comma/space-separated aliases.
    #[serde(default)]
    pub aliases: Option<String>,
}

impl BedOptions {
    /// Raw identifier tokens: the configured name plus every alias.
    pub fn identifier_tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.name.clone()];
        if let Some(aliases) = &self.aliases {
            tokens.extend(
                aliases
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
        tokens
    }

    /// The logical bed identity used for external entity topics: a 12-hex
    /// MAC extracted from name/aliases when present, else the lowercased
    /// name. Never the runtime BLE address, so which linked controller we
    /// happened to pick does not create duplicate entities.
    pub fn stable_id(&self) -> String {
        for token in self.identifier_tokens() {
            if let Some(mac) = extract_hex12(&token) {
                return mac;
            }
        }
        self.name.trim().to_lowercase()
    }
}

/// Resolved MQTT connection settings after `<auto_detect>` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Values the launcher discovered from the host environment, if any.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredBroker {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

fn resolve_host(configured: &str, discovered: Option<&str>) -> String {
    if configured != AUTO_DETECT {
        return configured.to_string();
    }
    match discovered {
        // supervisor-internal loopback is not reachable from the container
        Some("localhost") | Some("127.0.0.1") => "core-mosquitto".to_string(),
        Some(host) => host.to_string(),
        None => "172.30.32.1".to_string(),
    }
}

impl Options {
    pub fn mqtt_settings(&self, discovered: &DiscoveredBroker) -> Result<MqttSettings> {
        let host = resolve_host(&self.mqtt_host, discovered.host.as_deref());
        let port = if self.mqtt_port == AUTO_DETECT {
            discovered.port.unwrap_or(1883)
        } else {
            self.mqtt_port
                .parse::<u16>()
                .map_err(|_| BridgeError::Config(format!("invalid mqtt_port {:?}", self.mqtt_port)))?
        };
        let user = if self.mqtt_user == AUTO_DETECT {
            discovered.user.clone()
        } else if self.mqtt_user.is_empty() {
            None
        } else {
            Some(self.mqtt_user.clone())
        };
        let password = if self.mqtt_password == AUTO_DETECT {
            discovered.password.clone()
        } else if self.mqtt_password.is_empty() {
            None
        } else {
            Some(self.mqtt_password.clone())
        };
        Ok(MqttSettings {
            host,
            port,
            user,
            password,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.ble_proxies.is_empty() {
            return Err(BridgeError::Config("at least one BLE proxy is required".into()).into());
        }
        if self.beds.is_empty() {
            return Err(BridgeError::Config("at least one bed is required".into()).into());
        }
        for bed in &self.beds {
            if bed.name.trim().is_empty() {
                return Err(BridgeError::Config("bed with empty name".into()).into());
            }
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("SMARTBED_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/data/options.json"))
}

pub fn load(path: &Path) -> Result<Options> {
    let text = std::fs::read_to_string(path)
        .with_context(|| BridgeError::Config(format!("cannot read {}", path.display())))?;
    let options: Options = serde_json::from_str(&text)
        .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Options {
        serde_json::from_value(serde_json::json!({
            "mqttHost": "<auto_detect>",
            "mqttPort": "<auto_detect>",
            "mqttUser": "",
            "mqttPassword": "",
            "type": "keeson",
            "bleProxies": [{ "host": "10.0.0.50" }],
            "beds": [{
                "name": "KSBT-FDB45C1122AA",
                "friendlyName": "Bed1",
                "aliases": "master, bedroom-left"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn auto_detect_prefers_discovered_host() {
        let opts = sample();
        let settings = opts
            .mqtt_settings(&DiscoveredBroker {
                host: Some("10.1.1.5".into()),
                port: Some(1884),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(settings.host, "10.1.1.5");
        assert_eq!(settings.port, 1884);
    }

    #[test]
    fn auto_detect_rewrites_loopback() {
        let opts = sample();
        let settings = opts
            .mqtt_settings(&DiscoveredBroker {
                host: Some("127.0.0.1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(settings.host, "core-mosquitto");
    }

    #[test]
    fn auto_detect_falls_back_to_supervisor_address() {
        let opts = sample();
        let settings = opts.mqtt_settings(&DiscoveredBroker::default()).unwrap();
        assert_eq!(settings.host, "172.30.32.1");
        assert_eq!(settings.port, 1883);
    }

    #[test]
    fn explicit_values_pass_through() {
        let mut opts = sample();
        opts.mqtt_host = "broker.lan".into();
        opts.mqtt_port = "8883".into();
        opts.mqtt_user = "bed".into();
        let settings = opts.mqtt_settings(&DiscoveredBroker::default()).unwrap();
        assert_eq!(settings.host, "broker.lan");
        assert_eq!(settings.port, 8883);
        assert_eq!(settings.user.as_deref(), Some("bed"));
        assert_eq!(settings.password, None);
    }

    #[test]
    fn stable_id_prefers_embedded_mac() {
        let opts = sample();
        assert_eq!(opts.beds[0].stable_id(), "fdb45c1122aa");
    }

    #[test]
    fn stable_id_falls_back_to_lowercased_name() {
        let bed = BedOptions {
            name: "Master Bed".into(),
            friendly_name: "Bed".into(),
            stay_connected: false,
            aliases: None,
        };
        assert_eq!(bed.stable_id(), "master bed");
    }

    #[test]
    fn identifier_tokens_split_aliases() {
        let opts = sample();
        let tokens = opts.beds[0].identifier_tokens();
        assert_eq!(
            tokens,
            vec!["KSBT-FDB45C1122AA", "master", "bedroom-left"]
        );
    }

    #[test]
    fn invalid_port_is_config_error() {
        let mut opts = sample();
        opts.mqtt_port = "not-a-port".into();
        assert!(opts.mqtt_settings(&DiscoveredBroker::default()).is_err());
    }
}
