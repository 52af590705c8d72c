//! Records exchanged between device farm providers and the hub.
//!
//! Providers own the authoritative [`Device`] records and push them to the hub
//! inside a [`ProviderUpdate`] once per second. The hub keeps a projection of
//! each record and echoes it back through its listing endpoints, so every
//! record keeps fields it does not understand in a flattened `extra` map.

pub mod device;
pub mod envelope;
pub mod provider;

pub use device::{Device, DeviceOs, DeviceUsage, ProviderState};
pub use envelope::{ErrorEnvelope, ErrorValue};
pub use provider::{ProviderData, ProviderUpdate};

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Leading numeric component of a dotted version string (`"17.3.1"` → `17`).
pub fn major_version(version: &str) -> Option<u64> {
    let head = version.trim().split('.').next()?;
    let digits: String = head.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
