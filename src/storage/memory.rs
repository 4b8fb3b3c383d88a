use super::{
    DuplicateRow, EndpointReadStats, HourlyCostRow, ProviderCostRow, RecordStore, StorageError,
    StorageResult, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// In-process record store that evaluates the aggregate queries over a vector
/// of records. Used for tests and single-node setups without a database.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<Vec<UsageRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: UsageRecord) {
        self.records.write().await.push(record);
    }

    pub async fn insert_many(&self, records: impl IntoIterator<Item = UsageRecord>) {
        self.records.write().await.extend(records);
    }

    fn cutoff(window: Duration) -> StorageResult<DateTime<Utc>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StorageError::InvalidData(format!("Invalid window: {}", e)))?;
        Ok(Utc::now() - window)
    }

    async fn in_window(&self, window: Duration) -> StorageResult<Vec<UsageRecord>> {
        let cutoff = Self::cutoff(window)?;
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| record.time > cutoff)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct DuplicateAccumulator {
    count: i64,
    total_cost: f64,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct EndpointAccumulator {
    total_requests: i64,
    fingerprints: HashSet<String>,
    total_cost: f64,
    total_latency: f64,
}

#[derive(Default)]
struct ProviderAccumulator {
    request_count: i64,
    total_cost: f64,
    total_latency: f64,
    error_count: i64,
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn duplicate_groups(
        &self,
        window: Duration,
        limit: usize,
    ) -> StorageResult<Vec<DuplicateRow>> {
        let mut groups: HashMap<(String, String, String), DuplicateAccumulator> = HashMap::new();

        for record in self.in_window(window).await? {
            let key = (
                record.organization_id.clone(),
                record.endpoint.clone(),
                record.fingerprint(),
            );
            let group = groups.entry(key).or_default();
            group.count += 1;
            group.total_cost += record.cost;
            group.first_seen = Some(group.first_seen.map_or(record.time, |t| t.min(record.time)));
            group.last_seen = Some(group.last_seen.map_or(record.time, |t| t.max(record.time)));
        }

        let mut rows: Vec<DuplicateRow> = groups
            .into_iter()
            .filter(|(_, group)| group.count > 1)
            .filter_map(|((organization_id, endpoint, fingerprint), group)| {
                Some(DuplicateRow {
                    organization_id,
                    endpoint,
                    fingerprint,
                    count: group.count,
                    total_cost: group.total_cost,
                    first_seen: group.first_seen?,
                    last_seen: group.last_seen?,
                })
            })
            .collect();

        // Equal-cost groups are common, so ties need a total order before the cap
        rows.sort_by(|a, b| {
            b.total_cost
                .total_cmp(&a.total_cost)
                .then_with(|| a.organization_id.cmp(&b.organization_id))
                .then_with(|| a.endpoint.cmp(&b.endpoint))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn endpoint_read_stats(
        &self,
        window: Duration,
        min_requests: u64,
    ) -> StorageResult<Vec<EndpointReadStats>> {
        let mut endpoints: HashMap<String, EndpointAccumulator> = HashMap::new();

        for record in self.in_window(window).await? {
            if record.method != "GET" || record.status_code >= 400 {
                continue;
            }
            let stats = endpoints.entry(record.endpoint.clone()).or_default();
            stats.total_requests += 1;
            stats.fingerprints.insert(record.fingerprint());
            stats.total_cost += record.cost;
            stats.total_latency += f64::from(record.latency_ms);
        }

        Ok(endpoints
            .into_iter()
            .filter(|(_, stats)| stats.total_requests > min_requests as i64)
            .map(|(endpoint, stats)| EndpointReadStats {
                endpoint,
                total_requests: stats.total_requests,
                unique_requests: stats.fingerprints.len() as i64,
                total_cost: stats.total_cost,
                avg_latency_ms: stats.total_latency / stats.total_requests as f64,
            })
            .collect())
    }

    async fn hourly_org_costs(&self, window: Duration) -> StorageResult<Vec<HourlyCostRow>> {
        let mut buckets: HashMap<(String, DateTime<Utc>), (f64, i64)> = HashMap::new();

        for record in self.in_window(window).await? {
            let hour = record
                .time
                .duration_trunc(chrono::Duration::hours(1))
                .unwrap_or(record.time);
            let bucket = buckets
                .entry((record.organization_id.clone(), hour))
                .or_default();
            bucket.0 += record.cost;
            bucket.1 += 1;
        }

        Ok(buckets
            .into_iter()
            .map(
                |((organization_id, hour), (hourly_cost, request_count))| HourlyCostRow {
                    organization_id,
                    hour,
                    hourly_cost,
                    request_count,
                },
            )
            .collect())
    }

    async fn provider_costs(&self, window: Duration) -> StorageResult<Vec<ProviderCostRow>> {
        let mut providers: HashMap<String, ProviderAccumulator> = HashMap::new();

        for record in self.in_window(window).await? {
            let rollup = providers.entry(record.provider.clone()).or_default();
            rollup.request_count += 1;
            rollup.total_cost += record.cost;
            rollup.total_latency += f64::from(record.latency_ms);
            if record.is_error() {
                rollup.error_count += 1;
            }
        }

        Ok(providers
            .into_iter()
            .map(|(provider, rollup)| ProviderCostRow {
                provider,
                request_count: rollup.request_count,
                total_cost: rollup.total_cost,
                avg_latency_ms: rollup.total_latency / rollup.request_count as f64,
                error_count: rollup.error_count,
            })
            .collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_record;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[tokio::test]
    async fn test_duplicate_groups_require_repeat() {
        let store = MemoryRecordStore::new();
        let record = sample_record("org-1", "openai", "/v1/chat");

        store.insert(record.clone()).await;
        assert!(store.duplicate_groups(HOUR, 100).await.unwrap().is_empty());

        store.insert(record.clone()).await;
        let groups = store.duplicate_groups(HOUR, 100).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].organization_id, "org-1");
        assert_eq!(groups[0].fingerprint, record.fingerprint());
        assert!((groups[0].total_cost - record.cost * 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_duplicate_groups_are_scoped_per_organization() {
        let store = MemoryRecordStore::new();
        store
            .insert(sample_record("org-1", "openai", "/v1/chat"))
            .await;
        store
            .insert(sample_record("org-2", "openai", "/v1/chat"))
            .await;

        assert!(store.duplicate_groups(HOUR, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_outside_window_are_ignored() {
        let store = MemoryRecordStore::new();
        let mut old = sample_record("org-1", "openai", "/v1/chat");
        old.time = Utc::now() - chrono::Duration::hours(2);
        store.insert(old.clone()).await;
        store.insert(old).await;

        assert!(store.duplicate_groups(HOUR, 100).await.unwrap().is_empty());
        assert_eq!(store.provider_costs(HOUR).await.unwrap().len(), 0);
        assert_eq!(store.provider_costs(DAY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_read_stats_filters_method_and_status() {
        let store = MemoryRecordStore::new();
        for i in 0..12 {
            let mut record = sample_record("org-1", "weather", "/v1/forecast");
            record.method = "GET".to_string();
            record
                .metadata
                .insert("city".to_string(), format!("city-{}", i % 3));
            store.insert(record).await;
        }
        let mut failed = sample_record("org-1", "weather", "/v1/forecast");
        failed.method = "GET".to_string();
        failed.status_code = 500;
        store.insert(failed).await;

        let mut post = sample_record("org-1", "weather", "/v1/forecast");
        post.method = "POST".to_string();
        store.insert(post).await;

        let stats = store.endpoint_read_stats(DAY, 10).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_requests, 12);
        assert_eq!(stats[0].unique_requests, 3);
    }

    #[tokio::test]
    async fn test_endpoint_read_stats_minimum_is_exclusive() {
        let store = MemoryRecordStore::new();
        for _ in 0..10 {
            let mut record = sample_record("org-1", "weather", "/v1/forecast");
            record.method = "GET".to_string();
            store.insert(record).await;
        }

        assert!(store.endpoint_read_stats(DAY, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hourly_costs_bucket_by_clock_hour() {
        let store = MemoryRecordStore::new();
        let hour = Utc::now()
            .duration_trunc(chrono::Duration::hours(1))
            .unwrap();

        let mut a = sample_record("org-1", "openai", "/v1/chat");
        a.time = hour + chrono::Duration::minutes(1);
        a.cost = 1.5;
        let mut b = a.clone();
        b.cost = 2.5;
        b.time = hour + chrono::Duration::seconds(30);
        store.insert_many([a, b]).await;

        let rows = store.hourly_org_costs(DAY).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hour, hour);
        assert_eq!(rows[0].request_count, 2);
        assert!((rows[0].hourly_cost - 4.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_provider_costs_count_errors() {
        let store = MemoryRecordStore::new();
        let mut ok = sample_record("org-1", "stripe", "/v1/charges");
        ok.latency_ms = 100;
        let mut err = ok.clone();
        err.status_code = 502;
        err.latency_ms = 300;
        store.insert_many([ok, err]).await;

        let rows = store.provider_costs(DAY).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 2);
        assert_eq!(rows[0].error_count, 1);
        assert!((rows[0].avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicate_cap_is_stable_under_cost_ties() {
        let store = MemoryRecordStore::new();
        for i in 0..30 {
            let record = sample_record(&format!("org-{:02}", i), "openai", "/v1/chat");
            store.insert_many([record.clone(), record]).await;
        }

        let first = store.duplicate_groups(HOUR, 10).await.unwrap();
        let orgs: Vec<&str> = first.iter().map(|g| g.organization_id.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("org-{:02}", i)).collect();
        assert_eq!(orgs, expected);

        for _ in 0..5 {
            let again = store.duplicate_groups(HOUR, 10).await.unwrap();
            assert_eq!(again, first);
        }
    }
}
