//! Client configuration

use serde::Deserialize;
use std::time::Duration;

/// Default service endpoint when none is configured.
pub const DEFAULT_ENDPOINT: &str = "localhost:50051";

/// Default per-device ring capacity (packets per buffer half).
pub const DEFAULT_RING_CAPACITY: usize = 500;

/// Tunable settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service endpoint, `host:port`. Insecure credentials are assumed.
    pub endpoint: String,

    /// How often the channel monitor polls the transport state.
    pub monitor_interval: Duration,

    /// Capacity of each ring half; a ring retains at most twice this many
    /// packets.
    pub ring_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            monitor_interval: Duration::from_secs(1),
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Config pointing at a specific endpoint, defaults elsewhere.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, "localhost:50051");
        assert_eq!(config.monitor_interval, Duration::from_secs(1));
        assert_eq!(config.ring_capacity, 500);
    }
}
