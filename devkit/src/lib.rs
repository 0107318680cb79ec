//! Test tooling for the smartbed bridge.
//!
//! Lets components be exercised without real hardware: a scripted fake
//! proxy TCP server speaking the bridge's wire framing, plus advertisement
//! builders for discovery tests. The bridge's own recording bus handle
//! covers the MQTT side.

pub mod adverts;
pub mod fake_proxy;

pub use fake_proxy::{ConnectStep, FakeProxy, FakeProxyBehavior, ServicesStep};
