//! Derived-state cache
//!
//! Key/value store with per-key expiry holding the latest artifact of every
//! analysis job, plus the publish/subscribe channel used for lightweight
//! notifications. Values are JSON so artifacts stay self-describing.

use futures_util::stream::BoxStream;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub mod config;
pub mod memory;
pub mod redis;

use crate::artifacts::CachedArtifact;
use crate::cache::config::CacheConfig;
use crate::cache::memory::MemoryCache;
use crate::cache::redis::RedisCache;
use crate::health::{HealthCheckResult, HealthChecker};

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Stream of raw notification payloads from one pub/sub channel
pub type EventStream = BoxStream<'static, String>;

#[derive(Clone)]
enum CacheBackend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

/// Cache manager shared by the analysis jobs, the gateway and the read API
#[derive(Clone)]
pub struct CacheManager {
    config: CacheConfig,
    backend: CacheBackend,
}

impl CacheManager {
    /// Memory backend (for testing/single instance)
    pub fn new_memory() -> Self {
        Self {
            config: CacheConfig {
                backend: "memory".to_string(),
                ..Default::default()
            },
            backend: CacheBackend::Memory(MemoryCache::new()),
        }
    }

    /// Create cache manager from configuration, failing early if Redis is unreachable
    pub async fn new_from_config(config: &CacheConfig) -> CacheResult<Self> {
        let backend = match config.backend.as_str() {
            "redis" => {
                let redis = RedisCache::new(
                    &config.redis_url,
                    config.key_prefix.clone(),
                    config.command_timeout(),
                )?;
                redis.connect().await?;
                CacheBackend::Redis(redis)
            }
            "memory" => CacheBackend::Memory(MemoryCache::new()),
            other => {
                return Err(CacheError::Cache(format!(
                    "Unknown cache backend '{}'",
                    other
                )));
            }
        };

        Ok(Self {
            config: config.clone(),
            backend,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Channel carrying ingestion and cost-update notifications
    pub fn events_channel(&self) -> &str {
        &self.config.events_channel
    }

    pub async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        let start = Instant::now();
        let result = match &self.backend {
            CacheBackend::Memory(cache) => cache.get(key).await,
            CacheBackend::Redis(cache) => cache.get(key).await,
        };
        self.record_operation("get", start, &result);
        result
    }

    pub async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let start = Instant::now();
        let result = match &self.backend {
            CacheBackend::Memory(cache) => cache.set(key, value, Some(ttl)).await,
            CacheBackend::Redis(cache) => cache.set(key, value, Some(ttl)).await,
        };
        self.record_operation("set", start, &result);
        result
    }

    /// Make writes to a memory backend fail
    #[cfg(test)]
    pub(crate) fn reject_writes(&self, reject: bool) {
        if let CacheBackend::Memory(cache) = &self.backend {
            cache.reject_writes(reject);
        }
    }

    /// Publish a notification, returning how many subscribers received it
    pub async fn publish(&self, channel: &str, message: String) -> CacheResult<usize> {
        let start = Instant::now();
        let result = match &self.backend {
            CacheBackend::Memory(cache) => cache.publish(channel, message).await,
            CacheBackend::Redis(cache) => cache.publish(channel, message).await,
        };
        self.record_operation("publish", start, &result);
        result
    }

    pub async fn subscribe(&self, channel: &str) -> CacheResult<EventStream> {
        match &self.backend {
            CacheBackend::Memory(cache) => cache.subscribe(channel).await,
            CacheBackend::Redis(cache) => cache.subscribe(channel).await,
        }
    }

    /// Read an artifact; absent or expired keys yield `None`
    pub async fn get_artifact<T: CachedArtifact>(&self) -> CacheResult<Option<T>> {
        match self.get_raw(T::cache_key()).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Overwrite an artifact under its fixed key
    pub async fn put_artifact<T: CachedArtifact>(
        &self,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let raw =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set_raw(T::cache_key(), raw, ttl).await
    }

    /// Read an artifact for display. Missing, expired, unreadable or
    /// malformed artifacts all fall back to the empty default.
    pub async fn read_artifact_or_default<T: CachedArtifact>(&self) -> T {
        match self.get_artifact::<T>().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("Artifact '{}' absent, serving empty default", T::cache_key());
                T::empty()
            }
            Err(e) => {
                warn!(
                    "Failed to read artifact '{}', serving empty default: {}",
                    T::cache_key(),
                    e
                );
                T::empty()
            }
        }
    }

    fn record_operation<T>(
        &self,
        operation: &'static str,
        start: Instant,
        result: &CacheResult<T>,
    ) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        crate::metrics::record_cache_operation(operation, outcome, start.elapsed());
    }

    pub async fn health_check(&self) -> HealthCheckResult {
        match &self.backend {
            CacheBackend::Redis(cache) => match cache.health_check().await {
                Ok(()) => HealthCheckResult::healthy_with_details(serde_json::json!({
                    "backend": "redis",
                    "status": "connected"
                })),
                Err(err) => HealthCheckResult::unhealthy_with_details(
                    "Redis health check failed".to_string(),
                    serde_json::json!({
                        "backend": "redis",
                        "status": "disconnected",
                        "error": err.to_string()
                    }),
                ),
            },
            // Memory cache always passes health check
            CacheBackend::Memory(_) => HealthCheckResult::healthy_with_details(serde_json::json!({
                "backend": "memory",
                "status": "connected"
            })),
        }
    }

    fn backend_type(&self) -> &str {
        &self.config.backend
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new_memory()
    }
}

#[async_trait::async_trait]
impl HealthChecker for CacheManager {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> HealthCheckResult {
        self.health_check().await
    }

    fn info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "service": "Cache Manager",
            "backend": self.backend_type()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{CostBreakdown, CostSnapshot, DuplicatesArtifact, COSTS_KEY};
    use futures_util::StreamExt;

    fn snapshot() -> CostSnapshot {
        CostSnapshot {
            breakdown: vec![CostBreakdown {
                label: "openai".to_string(),
                cost: 12.5,
                request_count: 3,
                avg_latency: 120.0,
                error_count: 0,
            }],
            total_cost: 12.5,
            updated_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_artifact_round_trip_uses_fixed_key() {
        let cache = CacheManager::new_memory();
        let value = snapshot();
        cache
            .put_artifact(&value, Duration::from_secs(300))
            .await
            .unwrap();

        let raw = cache.get_raw(COSTS_KEY).await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["total_cost"], 12.5);
        assert_eq!(json["breakdown"][0]["label"], "openai");

        let read: CostSnapshot = cache.get_artifact().await.unwrap().unwrap();
        assert_eq!(read, value);
    }

    #[tokio::test]
    async fn test_expired_artifact_reads_as_empty_default() {
        let cache = CacheManager::new_memory();
        cache
            .put_artifact(&snapshot(), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get_artifact::<CostSnapshot>().await.unwrap().is_none());
        let read: CostSnapshot = cache.read_artifact_or_default().await;
        assert_eq!(read, CostSnapshot::empty());
    }

    #[tokio::test]
    async fn test_malformed_artifact_reads_as_empty_default() {
        let cache = CacheManager::new_memory();
        cache
            .set_raw(
                DuplicatesArtifact::cache_key(),
                "not json".to_string(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(matches!(
            cache.get_artifact::<DuplicatesArtifact>().await,
            Err(CacheError::Serialization(_))
        ));
        let read: DuplicatesArtifact = cache.read_artifact_or_default().await;
        assert!(read.items.is_empty());
    }

    #[tokio::test]
    async fn test_publish_subscribe_through_manager() {
        let cache = CacheManager::new_memory();
        let mut events = cache.subscribe(cache.events_channel()).await.unwrap();

        let delivered = cache
            .publish(cache.events_channel(), r#"{"type":"new_request"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            events.next().await.as_deref(),
            Some(r#"{"type":"new_request"}"#)
        );
    }

    #[tokio::test]
    async fn test_unknown_backend_is_rejected() {
        let config = CacheConfig {
            backend: "memcached".to_string(),
            ..Default::default()
        };
        assert!(CacheManager::new_from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_health_check() {
        let cache = CacheManager::new_memory();
        let result = cache.check().await;
        assert_eq!(result.status, crate::health::HealthStatus::Healthy);
    }
}
