use super::{
    ANOMALIES_JOB, AnomaliesConfig, EmptyRunTracker, Job, JobResult, publish_list_artifact,
};
use crate::{
    artifacts::Anomaly,
    cache::CacheManager,
    error::AppError,
    storage::{HourlyCostRow, RecordStore},
};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info};

pub const COST_SPIKE: &str = "cost_spike";
pub const SEVERITY_HIGH: &str = "high";

/// Flags hourly cost buckets far above an organization's own baseline
pub struct AnomalyDetectionJob {
    store: Arc<dyn RecordStore>,
    cache: CacheManager,
    config: AnomaliesConfig,
    empty_runs: EmptyRunTracker,
}

impl AnomalyDetectionJob {
    pub fn new(store: Arc<dyn RecordStore>, cache: CacheManager, config: AnomaliesConfig) -> Self {
        let empty_runs = EmptyRunTracker::new(config.clear_after_empty_runs);
        Self {
            store,
            cache,
            config,
            empty_runs,
        }
    }
}

/// Mean and population standard deviation of one organization's hourly costs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBaseline {
    pub mean: f64,
    pub std_dev: f64,
}

impl CostBaseline {
    /// `None` for distributions that cannot produce a meaningful threshold
    pub fn from_costs(costs: &[f64], min_buckets: usize) -> Option<Self> {
        if costs.is_empty() || costs.len() < min_buckets {
            return None;
        }
        let n = costs.len() as f64;
        let mean = costs.iter().sum::<f64>() / n;
        let variance = costs.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        if !mean.is_finite() || !std_dev.is_finite() || std_dev == 0.0 {
            return None;
        }
        Some(Self { mean, std_dev })
    }

    pub fn threshold(&self, sigma: f64) -> f64 {
        self.mean + sigma * self.std_dev
    }
}

pub fn detect_anomalies(rows: Vec<HourlyCostRow>, config: &AnomaliesConfig) -> Vec<Anomaly> {
    let mut by_org: BTreeMap<String, Vec<HourlyCostRow>> = BTreeMap::new();
    for row in rows {
        by_org.entry(row.organization_id.clone()).or_default().push(row);
    }

    let mut anomalies = Vec::new();
    for (organization_id, mut buckets) in by_org {
        // Store rows arrive unordered; a fixed order keeps the float sums stable
        buckets.sort_by_key(|b| b.hour);
        let costs: Vec<f64> = buckets.iter().map(|b| b.hourly_cost).collect();
        let Some(baseline) = CostBaseline::from_costs(&costs, config.min_buckets) else {
            debug!(
                organization_id = %organization_id,
                buckets = costs.len(),
                "Skipping degenerate cost distribution"
            );
            continue;
        };
        let threshold = baseline.threshold(config.sigma_threshold);

        for bucket in buckets.into_iter().filter(|b| b.hourly_cost > threshold) {
            let above_pct = (bucket.hourly_cost - baseline.mean) / baseline.mean * 100.0;
            anomalies.push(Anomaly {
                anomaly_type: COST_SPIKE.to_string(),
                severity: SEVERITY_HIGH.to_string(),
                description: format!(
                    "Cost spike: ${:.2} ({:.0}% above average). {} requests/hour.",
                    bucket.hourly_cost, above_pct, bucket.request_count
                ),
                detected_at: bucket.hour,
                organization_id: bucket.organization_id,
                hourly_cost: bucket.hourly_cost,
                baseline_cost: baseline.mean,
            });
        }
    }

    // Newest first
    anomalies.sort_by(|a, b| {
        b.detected_at
            .cmp(&a.detected_at)
            .then_with(|| a.organization_id.cmp(&b.organization_id))
    });
    anomalies
}

#[async_trait]
impl Job for AnomalyDetectionJob {
    fn name(&self) -> &str {
        ANOMALIES_JOB
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let window = Duration::from_secs(self.config.window_hours * 3600);
        let rows = self.store.hourly_org_costs(window).await?;

        let anomalies = detect_anomalies(rows, &self.config);
        if !anomalies.is_empty() {
            info!("Detected {} cost anomalies", anomalies.len());
        }

        let result = publish_list_artifact(
            &self.cache,
            &self.empty_runs,
            ANOMALIES_JOB,
            anomalies,
            Duration::from_secs(self.config.ttl_seconds),
        )
        .await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, DurationRound, Utc};

    fn hours_ago(n: i64) -> DateTime<Utc> {
        Utc::now().duration_trunc(chrono::Duration::hours(1)).unwrap() - chrono::Duration::hours(n)
    }

    fn series(org: &str, costs: &[f64]) -> Vec<HourlyCostRow> {
        costs
            .iter()
            .enumerate()
            .map(|(i, cost)| HourlyCostRow {
                organization_id: org.to_string(),
                hour: hours_ago((costs.len() - 1 - i) as i64),
                hourly_cost: *cost,
                request_count: 7,
            })
            .collect()
    }

    #[test]
    fn test_single_moderate_outlier_is_not_flagged() {
        let anomalies = detect_anomalies(
            series("org-1", &[10.0, 10.0, 10.0, 10.0, 100.0]),
            &AnomaliesConfig::default(),
        );
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_large_spike_is_flagged() {
        let mut costs = vec![10.0; 23];
        costs.push(1000.0);
        let anomalies = detect_anomalies(series("org-1", &costs), &AnomaliesConfig::default());

        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.hourly_cost, 1000.0);
        assert_eq!(anomaly.anomaly_type, "cost_spike");
        assert_eq!(anomaly.severity, "high");
        assert_eq!(anomaly.detected_at, hours_ago(0));
        assert!(anomaly.description.starts_with("Cost spike: $1000.00 ("));
        assert!(anomaly.description.ends_with("7 requests/hour."));
    }

    #[test]
    fn test_degenerate_distributions_are_excluded() {
        let config = AnomaliesConfig::default();
        assert!(detect_anomalies(series("flat", &[5.0; 24]), &config).is_empty());
        assert!(detect_anomalies(series("single", &[500.0]), &config).is_empty());
        assert!(CostBaseline::from_costs(&[], 2).is_none());
        assert!(CostBaseline::from_costs(&[1.0, f64::INFINITY], 2).is_none());
    }

    #[test]
    fn test_population_standard_deviation() {
        let baseline = CostBaseline::from_costs(&[10.0, 10.0, 10.0, 10.0, 100.0], 2).unwrap();
        assert!((baseline.mean - 28.0).abs() < 1e-9);
        assert!((baseline.std_dev - 36.0).abs() < 1e-9);
        assert!((baseline.threshold(3.0) - 136.0).abs() < 1e-9);
    }

    #[test]
    fn test_organizations_use_their_own_baseline() {
        let noisy: Vec<f64> = (0..23)
            .map(|i| if i % 2 == 0 { 900.0 } else { 1100.0 })
            .collect();
        let mut rows = series("big", &noisy);
        rows.push(HourlyCostRow {
            organization_id: "big".to_string(),
            hour: hours_ago(0),
            hourly_cost: 1001.0,
            request_count: 1,
        });
        let mut small = vec![1.0; 23];
        small.push(100.0);
        rows.extend(series("small", &small));

        let anomalies = detect_anomalies(rows, &AnomaliesConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].organization_id, "small");
    }
}
