use super::{
    CACHE_OPPORTUNITIES_JOB, CacheOpportunitiesConfig, EmptyRunTracker, Job, JobResult,
    publish_list_artifact, round2,
};
use crate::{
    artifacts::CacheRecommendation,
    cache::CacheManager,
    error::AppError,
    storage::{EndpointReadStats, RecordStore},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Scores read endpoints by how many of their calls repeat an earlier request
pub struct CacheOpportunityJob {
    store: Arc<dyn RecordStore>,
    cache: CacheManager,
    config: CacheOpportunitiesConfig,
    empty_runs: EmptyRunTracker,
}

impl CacheOpportunityJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: CacheManager,
        config: CacheOpportunitiesConfig,
    ) -> Self {
        let empty_runs = EmptyRunTracker::new(config.clear_after_empty_runs);
        Self {
            store,
            cache,
            config,
            empty_runs,
        }
    }
}

/// Percentage of calls that repeated an earlier fingerprint, rounded to 2 decimals
pub fn cache_hit_ratio(total_requests: i64, unique_requests: i64) -> f64 {
    if total_requests <= 0 {
        return 0.0;
    }
    let repeated = (total_requests - unique_requests).max(0) as f64;
    round2(100.0 * repeated / total_requests as f64)
}

/// TTL suggestion: ten seconds per whole second of mean upstream latency
pub fn suggested_ttl_seconds(avg_latency_ms: f64) -> u64 {
    if !avg_latency_ms.is_finite() || avg_latency_ms <= 0.0 {
        return 0;
    }
    (avg_latency_ms / 1000.0).floor() as u64 * 10
}

pub fn recommend(
    stats: Vec<EndpointReadStats>,
    config: &CacheOpportunitiesConfig,
) -> Vec<CacheRecommendation> {
    let mut recommendations: Vec<CacheRecommendation> = stats
        .into_iter()
        .filter(|s| s.total_requests > config.min_requests as i64)
        .filter(|s| s.unique_requests < s.total_requests)
        .filter_map(|s| {
            let ratio = cache_hit_ratio(s.total_requests, s.unique_requests);
            if ratio <= 0.0 {
                return None;
            }
            let ttl = suggested_ttl_seconds(s.avg_latency_ms);
            Some(CacheRecommendation {
                potential_savings: s.total_cost * (ratio / 100.0) * config.savings_factor,
                recommendation: format!(
                    "Cache this endpoint with TTL of {} seconds. Could save {:.2}% of requests.",
                    ttl, ratio
                ),
                endpoint: s.endpoint,
                total_requests: s.total_requests,
                unique_requests: s.unique_requests,
                cache_hit_ratio: ratio,
                suggested_ttl_seconds: ttl,
            })
        })
        .collect();

    recommendations.sort_by(|a, b| {
        b.cache_hit_ratio
            .total_cmp(&a.cache_hit_ratio)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
    recommendations.truncate(config.limit);
    recommendations
}

#[async_trait]
impl Job for CacheOpportunityJob {
    fn name(&self) -> &str {
        CACHE_OPPORTUNITIES_JOB
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let window = Duration::from_secs(self.config.window_hours * 3600);
        let stats = self
            .store
            .endpoint_read_stats(window, self.config.min_requests)
            .await?;

        let recommendations = recommend(stats, &self.config);
        if !recommendations.is_empty() {
            info!("Found {} cache opportunities", recommendations.len());
        }

        let result = publish_list_artifact(
            &self.cache,
            &self.empty_runs,
            CACHE_OPPORTUNITIES_JOB,
            recommendations,
            Duration::from_secs(self.config.ttl_seconds),
        )
        .await;
        Ok(result)
    }
}
