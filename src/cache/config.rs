use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    /// Pub/sub channel carrying ingestion and cost-update notifications
    #[serde(default = "default_events_channel")]
    pub events_channel: String,
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_command_timeout_seconds() -> u64 {
    2
}

fn default_events_channel() -> String {
    "api_events".to_string()
}

impl CacheConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            command_timeout_seconds: default_command_timeout_seconds(),
            events_channel: default_events_channel(),
        }
    }
}
