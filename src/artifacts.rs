//! Derived artifacts
//!
//! Self-describing JSON snapshots produced by the analysis jobs and read by
//! the gateway and the dashboard API. Field names are part of the wire
//! contract with dashboard clients and must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const COSTS_KEY: &str = "costs:24h:by_provider";
pub const DUPLICATES_KEY: &str = "analytics:duplicates";
pub const CACHE_RECOMMENDATIONS_KEY: &str = "analytics:cache_recommendations";
pub const ANOMALIES_KEY: &str = "analytics:anomalies";

/// An artifact stored under a fixed cache key.
///
/// `empty()` is what readers see when the key is absent or expired.
pub trait CachedArtifact: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn cache_key() -> &'static str;

    fn empty() -> Self;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    pub organization_id: String,
    pub endpoint: String,
    pub fingerprint: String,
    pub count: i64,
    pub cost: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecommendation {
    pub endpoint: String,
    pub total_requests: i64,
    pub unique_requests: i64,
    pub cache_hit_ratio: f64,
    pub potential_savings: f64,
    pub suggested_ttl_seconds: u64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub severity: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub organization_id: String,
    pub hourly_cost: f64,
    pub baseline_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub label: String,
    pub cost: f64,
    pub request_count: i64,
    pub avg_latency: f64,
    pub error_count: i64,
}

/// Cost rollup artifact, also the payload of the gateway's initial snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostSnapshot {
    pub breakdown: Vec<CostBreakdown>,
    pub total_cost: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Envelope for the list-shaped analysis artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisArtifact<T> {
    pub generated_at: Option<DateTime<Utc>>,
    pub items: Vec<T>,
}

impl<T> AnalysisArtifact<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            generated_at: Some(Utc::now()),
            items,
        }
    }

    pub fn cleared() -> Self {
        Self::new(Vec::new())
    }
}

impl CachedArtifact for CostSnapshot {
    fn cache_key() -> &'static str {
        COSTS_KEY
    }

    fn empty() -> Self {
        Self {
            breakdown: Vec::new(),
            total_cost: 0.0,
            updated_at: None,
        }
    }
}

macro_rules! list_artifact {
    ($item:ty, $key:expr) => {
        impl CachedArtifact for AnalysisArtifact<$item> {
            fn cache_key() -> &'static str {
                $key
            }

            fn empty() -> Self {
                Self {
                    generated_at: None,
                    items: Vec::new(),
                }
            }
        }
    };
}

list_artifact!(DuplicateGroup, DUPLICATES_KEY);
list_artifact!(CacheRecommendation, CACHE_RECOMMENDATIONS_KEY);
list_artifact!(Anomaly, ANOMALIES_KEY);

pub type DuplicatesArtifact = AnalysisArtifact<DuplicateGroup>;
pub type CacheRecommendationsArtifact = AnalysisArtifact<CacheRecommendation>;
pub type AnomaliesArtifact = AnalysisArtifact<Anomaly>;
