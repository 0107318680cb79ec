//! Error taxonomy for the bridge.
//!
//! Every failure that crosses a component boundary is one of these kinds;
//! retryability drives the retry engine and the health monitor's escalation,
//! and the socket/BLE classification decides the process exit code.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Startup configuration is invalid. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// The proxy readiness gate expired before the link was usable.
    #[error("proxy API not ready after {0:?}")]
    ApiNotReady(Duration),

    /// Transport-level failure on the proxy socket or the bus.
    #[error("socket error: {0}")]
    Socket(String),

    /// The proxy presented a different server name than configured.
    /// The retry outer layer pins the presented name and tries again.
    #[error("Server name mismatch, expected {expected}, got {presented}")]
    NameMismatch { expected: String, presented: String },

    /// The proxy refused a connect request ("request ignored").
    #[error("connection request ignored by proxy: {0}")]
    ProxyIgnored(String),

    /// The proxy log reported a hard controller failure (status=133 class).
    #[error("hard BLE failure: {0}")]
    HardFailure(String),

    /// GATT services discovery or a known response wait timed out.
    #[error("BLE timeout: {0}")]
    BleTimeout(String),

    /// No candidate controller passed the vendor probe; the bed is skipped.
    #[error("no supported controller found for bed {0}")]
    NotSupported(String),

    /// Two beds resolve to the same normalized identifier.
    #[error("duplicate identifier {identifier:?} configured for both {first} and {second}")]
    DuplicateIdentifier {
        identifier: String,
        first: String,
        second: String,
    },

    /// The vendor builder produced no controller for a matched candidate.
    #[error("vendor produced no controller for bed {0}")]
    ControllerBuildFailed(String),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BridgeError::Config(_)
                | BridgeError::DuplicateIdentifier { .. }
                | BridgeError::NotSupported(_)
        )
    }
}

/// Substrings that mark a write failure as transient (case-insensitive).
const TRANSIENT_MARKERS: &[&str] = &[
    "not connected",
    "disconnected",
    "gatt",
    "timeout",
    "busy",
    "reset",
];

/// Substrings that mark a transport error as socket-class.
const SOCKET_MARKERS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "ehostunreach",
    "enetunreach",
    "write after end",
    "unknown protocol",
    "bad format",
    "broken pipe",
    "connection refused",
    "connection reset",
];

/// Connect failures inside the proxy's own reconnect window; worth a short
/// in-place retry before surfacing.
const API_WINDOW_MARKERS: &[&str] = &[
    "esphome api not ready",
    "not connected",
    "not authorized",
    "socket is not connected",
];

/// Connect failures that mean the API session itself is dead and only a full
/// restart helps.
const DEAD_API_MARKERS: &[&str] = &[
    "econnreset",
    "err_stream_write_after_end",
    "write after end",
    "bad format",
    "unknown protocol selected by server",
];

fn message_contains_any(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

pub fn message_is_transient(message: &str) -> bool {
    message_contains_any(message, TRANSIENT_MARKERS)
}

pub fn message_is_socket(message: &str) -> bool {
    message_contains_any(message, SOCKET_MARKERS)
}

pub fn message_is_api_window(message: &str) -> bool {
    message_contains_any(message, API_WINDOW_MARKERS)
}

pub fn message_is_dead_api(message: &str) -> bool {
    message_contains_any(message, DEAD_API_MARKERS)
}

/// Whether an error chain is socket/BLE-class. Used for the supervisor's
/// retry predicate and for the exit-code decision in `main`.
pub fn is_socket_or_ble(err: &anyhow::Error) -> bool {
    if let Some(bridge) = err.downcast_ref::<BridgeError>() {
        return matches!(
            bridge,
            BridgeError::Socket(_)
                | BridgeError::ApiNotReady(_)
                | BridgeError::BleTimeout(_)
                | BridgeError::HardFailure(_)
                | BridgeError::ProxyIgnored(_)
                | BridgeError::NameMismatch { .. }
        );
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return true;
    }
    let msg = format!("{err:#}");
    message_is_socket(&msg) || message_is_transient(&msg)
}

/// Parses the presented server name out of a name-mismatch error message.
/// Shape: `Server name mismatch, expected X, got Y`.
pub fn parse_name_mismatch(message: &str) -> Option<String> {
    let idx = message.find(", got ")?;
    let presented = message[idx + ", got ".len()..].trim();
    if presented.is_empty() {
        None
    } else {
        Some(presented.trim_end_matches('.').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_are_case_insensitive() {
        assert!(message_is_transient("GATT_BUSY from stack"));
        assert!(message_is_transient("device Not Connected"));
        assert!(message_is_transient("request Timeout after 12s"));
        assert!(!message_is_transient("invalid password"));
    }

    #[test]
    fn socket_class_detection() {
        assert!(message_is_socket("read failed: ECONNRESET"));
        assert!(message_is_socket("write after end"));
        assert!(!message_is_socket("services list empty"));
    }

    #[test]
    fn dead_api_vs_window() {
        assert!(message_is_api_window("esphome api not ready"));
        assert!(!message_is_dead_api("esphome api not ready"));
        assert!(message_is_dead_api("unknown protocol selected by server"));
    }

    #[test]
    fn name_mismatch_roundtrip() {
        let err = BridgeError::NameMismatch {
            expected: "10.0.0.111".into(),
            presented: "m5stack-atom-lite-fdb45c".into(),
        };
        let msg = err.to_string();
        assert_eq!(
            parse_name_mismatch(&msg).as_deref(),
            Some("m5stack-atom-lite-fdb45c")
        );
    }

    #[test]
    fn retryability() {
        assert!(BridgeError::BleTimeout("x".into()).is_retryable());
        assert!(BridgeError::Socket("x".into()).is_retryable());
        assert!(!BridgeError::Config("x".into()).is_retryable());
        assert!(!BridgeError::NotSupported("Bed1".into()).is_retryable());
    }
}
