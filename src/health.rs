use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: None,
            duration_ms: None,
        }
    }

    pub fn healthy_with_details(details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..Self::healthy()
        }
    }

    pub fn degraded_with_details(message: String, details: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message),
            details: Some(details),
            duration_ms: None,
        }
    }

    pub fn unhealthy(message: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message),
            details: None,
            duration_ms: None,
        }
    }

    pub fn unhealthy_with_details(message: String, details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..Self::unhealthy(message)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// A dependency whose connectivity is reported on `/health`
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;

    /// Static information about this component
    fn info(&self) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallHealthResponse {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub checks: HashMap<String, HealthCheckResult>,
    pub summary: HealthSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_checks: usize,
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub unhealthy_count: usize,
    pub total_duration_ms: u64,
}

pub struct HealthService {
    checkers: Arc<RwLock<HashMap<String, Arc<dyn HealthChecker>>>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self {
            checkers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        let name = checker.name().to_string();
        self.checkers.write().await.insert(name, checker);
    }

    pub async fn unregister(&self, name: &str) {
        self.checkers.write().await.remove(name);
    }

    /// Run every registered check (`None` or `"all"`) or only the named one.
    /// Checks run concurrently so one slow dependency does not serialize the rest.
    pub async fn check_health(&self, filter: Option<&str>) -> OverallHealthResponse {
        let selected: Vec<(String, Arc<dyn HealthChecker>)> = {
            let checkers = self.checkers.read().await;
            checkers
                .iter()
                .filter(|(name, _)| match filter {
                    None | Some("all") => true,
                    Some(specific) => name.as_str() == specific,
                })
                .map(|(name, checker)| (name.clone(), checker.clone()))
                .collect()
        };

        let results: HashMap<String, HealthCheckResult> =
            join_all(selected.into_iter().map(|(name, checker)| async move {
                let start = Instant::now();
                let result = checker.check().await;
                let duration = start.elapsed().as_millis() as u64;
                (name, result.with_duration(duration))
            }))
            .await
            .into_iter()
            .collect();

        let count = |status: HealthStatus| results.values().filter(|r| r.status == status).count();
        let healthy_count = count(HealthStatus::Healthy);
        let degraded_count = count(HealthStatus::Degraded);
        let unhealthy_count = count(HealthStatus::Unhealthy);

        // Worst status wins
        let overall_status = if unhealthy_count > 0 {
            HealthStatus::Unhealthy
        } else if degraded_count > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let summary = HealthSummary {
            total_checks: results.len(),
            healthy_count,
            degraded_count,
            unhealthy_count,
            total_duration_ms: results.values().filter_map(|r| r.duration_ms).sum(),
        };

        OverallHealthResponse {
            status: overall_status,
            service: "api-observatory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            checks: results,
            summary,
        }
    }

    pub async fn get_registered_checkers(&self) -> Vec<String> {
        self.checkers.read().await.keys().cloned().collect()
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}
