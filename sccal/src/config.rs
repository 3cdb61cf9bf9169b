//! Tunables of the discovery and polling machinery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The USB vendor ID of SC pedal controllers.
pub const DEFAULT_VENDOR_ID: u16 = 0x16C0;

/// The USB product ID of SC pedal controllers.
pub const DEFAULT_PRODUCT_ID: u16 = 0x0476;

/// Controls how often devices are scanned for and synced.
///
/// Durations are (de)serialized as integer milliseconds. Missing fields fall
/// back to their defaults, so a partial JSON document is a valid config.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// The minimum time between the completion of one discovery scan and the
    /// start of the next one.
    #[serde(rename = "discovery_interval_ms", with = "millis")]
    pub discovery_interval: Duration,

    /// Calls to [`DeviceContext::update`](crate::context::DeviceContext::update)
    /// within this window after the last one do nothing.
    #[serde(rename = "update_debounce_ms", with = "millis")]
    pub update_debounce: Duration,

    /// How long to wait for the reply to a single request.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,

    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_millis(1000),
            update_debounce: Duration::from_millis(10),
            request_timeout: Duration::from_millis(2000),
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
