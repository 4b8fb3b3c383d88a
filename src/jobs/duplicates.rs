use super::{
    DUPLICATES_JOB, DuplicatesConfig, EmptyRunTracker, Job, JobResult, publish_list_artifact,
};
use crate::{
    artifacts::DuplicateGroup,
    cache::CacheManager,
    error::AppError,
    storage::{DuplicateRow, RecordStore},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Finds repeated identical requests per organization and endpoint
pub struct DuplicateDetectionJob {
    store: Arc<dyn RecordStore>,
    cache: CacheManager,
    config: DuplicatesConfig,
    empty_runs: EmptyRunTracker,
}

impl DuplicateDetectionJob {
    pub fn new(store: Arc<dyn RecordStore>, cache: CacheManager, config: DuplicatesConfig) -> Self {
        let empty_runs = EmptyRunTracker::new(config.clear_after_empty_runs);
        Self {
            store,
            cache,
            config,
            empty_runs,
        }
    }
}

/// Keep only true duplicates, order by cost then identity, and cap
pub fn rank_duplicates(rows: Vec<DuplicateRow>, limit: usize) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = rows
        .into_iter()
        .filter(|row| row.count > 1)
        .map(|row| DuplicateGroup {
            organization_id: row.organization_id,
            endpoint: row.endpoint,
            fingerprint: row.fingerprint,
            count: row.count,
            cost: row.total_cost,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        })
        .collect();

    groups.sort_by(|a, b| {
        b.cost
            .total_cmp(&a.cost)
            .then_with(|| a.organization_id.cmp(&b.organization_id))
            .then_with(|| a.endpoint.cmp(&b.endpoint))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    groups.truncate(limit);
    groups
}

#[async_trait]
impl Job for DuplicateDetectionJob {
    fn name(&self) -> &str {
        DUPLICATES_JOB
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let window = Duration::from_secs(self.config.window_minutes * 60);
        let rows = self
            .store
            .duplicate_groups(window, self.config.limit)
            .await?;

        let groups = rank_duplicates(rows, self.config.limit);
        if !groups.is_empty() {
            info!("Found {} duplicate request groups", groups.len());
        }

        let result = publish_list_artifact(
            &self.cache,
            &self.empty_runs,
            DUPLICATES_JOB,
            groups,
            Duration::from_secs(self.config.ttl_seconds),
        )
        .await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(org: &str, fingerprint: &str, count: i64, cost: f64) -> DuplicateRow {
        DuplicateRow {
            organization_id: org.to_string(),
            endpoint: "/v1/chat".to_string(),
            fingerprint: fingerprint.to_string(),
            count,
            total_cost: cost,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_rank_orders_by_cost_and_caps() {
        let rows = vec![
            row("org-1", "a", 2, 1.0),
            row("org-1", "b", 3, 5.0),
            row("org-2", "c", 4, 3.0),
        ];
        let ranked = rank_duplicates(rows, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].fingerprint, "b");
        assert_eq!(ranked[1].fingerprint, "c");
    }

    #[test]
    fn test_rank_drops_singletons() {
        let ranked = rank_duplicates(vec![row("org-1", "a", 1, 9.0)], 100);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_ties_are_deterministic() {
        let rows = vec![row("org-2", "a", 2, 1.0), row("org-1", "b", 2, 1.0)];
        let ranked = rank_duplicates(rows, 100);
        assert_eq!(ranked[0].organization_id, "org-1");
        assert_eq!(ranked[1].organization_id, "org-2");
    }
}
