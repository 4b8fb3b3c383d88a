//! Realtime gateway
//!
//! Pushes the latest cost artifact to dashboard clients over WebSocket and
//! relays pub/sub notifications to them, interleaved with keepalive pings.
//! One upstream subscription (the relay) fans out to every connection
//! through a broadcast channel, so a slow client only lags itself.

pub mod registry;
pub mod relay;
pub mod session;

use crate::artifacts::CostSnapshot;
use crate::cache::CacheManager;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

pub use registry::{CloseReason, ConnectionHandle, ConnectionRegistry};
pub use relay::NotificationRelay;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Opening a connection beyond this evicts the longest-idle one
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-connection backlog of relayed events before the connection lags
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_write_timeout_seconds")]
    pub write_timeout_seconds: u64,
    #[serde(default = "default_relay_initial_backoff_ms")]
    pub relay_initial_backoff_ms: u64,
    #[serde(default = "default_relay_max_backoff_seconds")]
    pub relay_max_backoff_seconds: u64,
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    1000
}

fn default_event_buffer() -> usize {
    256
}

fn default_write_timeout_seconds() -> u64 {
    10
}

fn default_relay_initial_backoff_ms() -> u64 {
    500
}

fn default_relay_max_backoff_seconds() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            max_connections: default_max_connections(),
            event_buffer: default_event_buffer(),
            write_timeout_seconds: default_write_timeout_seconds(),
            relay_initial_backoff_ms: default_relay_initial_backoff_ms(),
            relay_max_backoff_seconds: default_relay_max_backoff_seconds(),
        }
    }
}

impl GatewayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn relay_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.relay_initial_backoff_ms.max(1))
    }

    pub fn relay_max_backoff(&self) -> Duration {
        Duration::from_secs(self.relay_max_backoff_seconds)
    }
}

/// Messages originated by the gateway itself. Relayed notifications are
/// forwarded as-is and are not part of this enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialData { data: CostSnapshot, timestamp: i64 },
    Ping,
}

/// Everything a WebSocket session needs, cheap to clone per connection
#[derive(Clone)]
pub struct Gateway {
    pub config: GatewayConfig,
    pub cache: CacheManager,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: Arc<NotificationRelay>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, cache: CacheManager) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let relay = Arc::new(NotificationRelay::new(config.event_buffer));
        Self {
            config,
            cache,
            registry,
            relay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_wire_format() {
        assert_eq!(
            serde_json::to_value(ServerMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn test_initial_data_wire_format() {
        let message = ServerMessage::InitialData {
            data: CostSnapshot {
                breakdown: Vec::new(),
                total_cost: 0.0,
                updated_at: None,
            },
            timestamp: 1_700_000_000,
        };
        assert_eq!(
            serde_json::to_value(message).unwrap(),
            json!({
                "type": "initial_data",
                "data": {"breakdown": [], "total_cost": 0.0, "updated_at": null},
                "timestamp": 1_700_000_000
            })
        );
    }

    #[test]
    fn test_default_ping_interval() {
        assert_eq!(
            GatewayConfig::default().ping_interval(),
            Duration::from_secs(30)
        );
    }
}
