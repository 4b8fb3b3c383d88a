//! Record store adapter
//!
//! Read-only analytical query surface over the usage record store. Every
//! query is bounded by a trailing time window and returns typed aggregate
//! rows; the analysis jobs do the ranking, capping and statistics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;

use crate::health::{HealthCheckResult, HealthChecker};

pub mod factory;
pub mod memory;
pub mod postgres;

pub use factory::StorageFactory;
pub use memory::MemoryRecordStore;
pub use postgres::PostgresRecordStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Query timed out: {0}")]
    Timeout(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A single ingested API call. Written once by ingestion and never mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub time: DateTime<Utc>,
    pub organization_id: String,
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: u32,
    pub request_size_bytes: u64,
    pub response_size_bytes: u64,
    pub cost: f64,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UsageRecord {
    pub fn fingerprint(&self) -> String {
        request_fingerprint(&self.endpoint, &self.method, &self.metadata)
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Stable hash identifying "the same logical request".
///
/// Metadata is a `BTreeMap`, so its JSON form has a fixed key order and the
/// digest does not depend on insertion order.
pub fn request_fingerprint(
    endpoint: &str,
    method: &str,
    metadata: &BTreeMap<String, String>,
) -> String {
    let metadata_json = serde_json::to_string(metadata).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// (organization, endpoint, fingerprint) cluster seen more than once in the window
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateRow {
    pub organization_id: String,
    pub endpoint: String,
    pub fingerprint: String,
    pub count: i64,
    pub total_cost: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Per-endpoint statistics for successful GET calls
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointReadStats {
    pub endpoint: String,
    pub total_requests: i64,
    pub unique_requests: i64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
}

/// Summed cost of one organization within one clock hour
#[derive(Clone, Debug, PartialEq)]
pub struct HourlyCostRow {
    pub organization_id: String,
    pub hour: DateTime<Utc>,
    pub hourly_cost: f64,
    pub request_count: i64,
}

/// Per-provider rollup row
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderCostRow {
    pub provider: String,
    pub request_count: i64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
    pub error_count: i64,
}

/// Read-only aggregate queries over the record store.
///
/// Implementations must be safe to share between every job and connection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Backend name for logging and health output
    fn backend_name(&self) -> &'static str;

    /// Groups seen more than once in the window, at most `limit` rows
    async fn duplicate_groups(
        &self,
        window: Duration,
        limit: usize,
    ) -> StorageResult<Vec<DuplicateRow>>;

    /// GET, status < 400 statistics for endpoints with more than `min_requests` calls
    async fn endpoint_read_stats(
        &self,
        window: Duration,
        min_requests: u64,
    ) -> StorageResult<Vec<EndpointReadStats>>;

    /// Hourly cost buckets per organization
    async fn hourly_org_costs(&self, window: Duration) -> StorageResult<Vec<HourlyCostRow>>;

    /// Per-provider rollup
    async fn provider_costs(&self, window: Duration) -> StorageResult<Vec<ProviderCostRow>>;

    /// Connectivity check
    async fn health_check(&self) -> StorageResult<()>;
}

/// Health checker wrapping whichever record store is configured
pub struct StoreHealthChecker {
    store: Arc<dyn RecordStore>,
}

impl StoreHealthChecker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for StoreHealthChecker {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.store.health_check().await {
            Ok(()) => HealthCheckResult::healthy_with_details(serde_json::json!({
                "backend": self.store.backend_name(),
                "status": "connected"
            })),
            Err(err) => HealthCheckResult::unhealthy_with_details(
                "Record store health check failed".to_string(),
                serde_json::json!({
                    "backend": self.store.backend_name(),
                    "status": "disconnected",
                    "error": err.to_string()
                }),
            ),
        }
    }

    fn info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "service": "Record Store",
            "backend": self.store.backend_name()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_stable_across_metadata_order() {
        let mut a = BTreeMap::new();
        a.insert("model".to_string(), "gpt-4".to_string());
        a.insert("user".to_string(), "42".to_string());

        let mut b = BTreeMap::new();
        b.insert("user".to_string(), "42".to_string());
        b.insert("model".to_string(), "gpt-4".to_string());

        assert_eq!(
            request_fingerprint("/v1/chat", "POST", &a),
            request_fingerprint("/v1/chat", "POST", &b)
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_method_and_metadata() {
        let meta = metadata(&[("q", "weather")]);
        let base = request_fingerprint("/v1/search", "GET", &meta);

        assert_ne!(base, request_fingerprint("/v1/search", "POST", &meta));
        assert_ne!(
            base,
            request_fingerprint("/v1/search", "GET", &metadata(&[("q", "news")]))
        );
        assert_ne!(base, request_fingerprint("/v1/other", "GET", &meta));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc"
        let empty = BTreeMap::new();
        assert_ne!(
            request_fingerprint("ab", "c", &empty),
            request_fingerprint("a", "bc", &empty)
        );
    }

    #[test]
    fn test_usage_record_error_classification() {
        let mut record = crate::test_utils::sample_record("org-1", "openai", "/v1/chat");
        record.status_code = 399;
        assert!(!record.is_error());
        record.status_code = 400;
        assert!(record.is_error());
    }
}
