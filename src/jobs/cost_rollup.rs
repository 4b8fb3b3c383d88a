use super::{COST_ROLLUP_JOB, CostRollupConfig, Job, JobResult, write_artifact};
use crate::{
    artifacts::{CostBreakdown, CostSnapshot},
    cache::CacheManager,
    error::AppError,
    storage::{ProviderCostRow, RecordStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Per-provider cost rollup, written every cycle even when empty
pub struct CostRollupJob {
    store: Arc<dyn RecordStore>,
    cache: CacheManager,
    config: CostRollupConfig,
}

impl CostRollupJob {
    pub fn new(store: Arc<dyn RecordStore>, cache: CacheManager, config: CostRollupConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }
}

pub fn build_snapshot(rows: Vec<ProviderCostRow>, updated_at: DateTime<Utc>) -> CostSnapshot {
    let mut breakdown: Vec<CostBreakdown> = rows
        .into_iter()
        .map(|row| CostBreakdown {
            label: row.provider,
            cost: row.total_cost,
            request_count: row.request_count,
            avg_latency: row.avg_latency_ms,
            error_count: row.error_count,
        })
        .collect();

    breakdown.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.label.cmp(&b.label)));
    let total_cost = breakdown.iter().map(|b| b.cost).sum();

    CostSnapshot {
        breakdown,
        total_cost,
        updated_at: Some(updated_at),
    }
}

#[async_trait]
impl Job for CostRollupJob {
    fn name(&self) -> &str {
        COST_ROLLUP_JOB
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let window = Duration::from_secs(self.config.window_hours * 3600);
        let rows = self.store.provider_costs(window).await?;

        let snapshot = build_snapshot(rows, Utc::now());
        let providers = snapshot.breakdown.len();

        let result = write_artifact(
            &self.cache,
            COST_ROLLUP_JOB,
            &snapshot,
            Duration::from_secs(self.config.ttl_seconds),
            providers as u64,
        )
        .await;

        // The notification is only sent once the artifact it announces exists
        if result.success && self.config.publish_events {
            let event = json!({
                "type": "costs_updated",
                "total_cost": snapshot.total_cost,
                "providers": providers,
                "timestamp": snapshot.updated_at.map(|t| t.timestamp()),
            });
            match self
                .cache
                .publish(self.cache.events_channel(), event.to_string())
                .await
            {
                Ok(receivers) => debug!(receivers, "Published costs_updated notification"),
                Err(e) => warn!(error = %e, "Failed to publish costs_updated notification"),
            }
        }

        Ok(result)
    }
}
