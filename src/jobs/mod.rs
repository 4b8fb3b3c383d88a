pub mod anomalies;
pub mod cache_opportunities;
pub mod cost_rollup;
pub mod duplicates;
pub mod scheduler;

use crate::{
    artifacts::{AnalysisArtifact, CachedArtifact},
    cache::CacheManager,
    error::AppError,
    storage::RecordStore,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, warn};

pub use anomalies::AnomalyDetectionJob;
pub use cache_opportunities::CacheOpportunityJob;
pub use cost_rollup::CostRollupJob;
pub use duplicates::DuplicateDetectionJob;
pub use scheduler::JobScheduler;

pub const DUPLICATES_JOB: &str = "duplicate_detection";
pub const CACHE_OPPORTUNITIES_JOB: &str = "cache_opportunities";
pub const ANOMALIES_JOB: &str = "anomaly_detection";
pub const COST_ROLLUP_JOB: &str = "cost_rollup";

pub const JOB_NAMES: [&str; 4] = [
    COST_ROLLUP_JOB,
    DUPLICATES_JOB,
    CACHE_OPPORTUNITIES_JOB,
    ANOMALIES_JOB,
];

/// Configuration for the analysis engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Enable/disable the internal job scheduler
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Shared cadence for every job unless overridden per job
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Run every job once immediately at startup
    #[serde(default = "default_true")]
    pub run_on_start: bool,

    #[serde(default)]
    pub duplicates: DuplicatesConfig,

    #[serde(default)]
    pub cache_opportunities: CacheOpportunitiesConfig,

    #[serde(default)]
    pub anomalies: AnomaliesConfig,

    #[serde(default)]
    pub cost_rollup: CostRollupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_duplicates_window_minutes")]
    pub window_minutes: u64,
    #[serde(default = "default_duplicates_limit")]
    pub limit: usize,
    #[serde(default = "default_analysis_ttl_seconds")]
    pub ttl_seconds: u64,
    /// `None` keeps the last non-empty artifact; `Some(n)` clears it after n empty runs
    pub clear_after_empty_runs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOpportunitiesConfig {
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,
    #[serde(default = "default_cache_limit")]
    pub limit: usize,
    /// Fraction of the repeated-call cost a cache is expected to recover
    #[serde(default = "default_savings_factor")]
    pub savings_factor: f64,
    #[serde(default = "default_analysis_ttl_seconds")]
    pub ttl_seconds: u64,
    pub clear_after_empty_runs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomaliesConfig {
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    #[serde(default = "default_sigma_threshold")]
    pub sigma_threshold: f64,
    /// Organizations with fewer hourly buckets are not evaluated
    #[serde(default = "default_min_buckets")]
    pub min_buckets: usize,
    #[serde(default = "default_analysis_ttl_seconds")]
    pub ttl_seconds: u64,
    pub clear_after_empty_runs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRollupConfig {
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    #[serde(default = "default_cost_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Publish a `costs_updated` notification after each successful write
    #[serde(default = "default_true")]
    pub publish_events: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_duplicates_window_minutes() -> u64 {
    60
}

fn default_duplicates_limit() -> usize {
    100
}

fn default_analysis_ttl_seconds() -> u64 {
    600
}

fn default_window_hours() -> u64 {
    24
}

fn default_min_requests() -> u64 {
    10
}

fn default_cache_limit() -> usize {
    50
}

fn default_savings_factor() -> f64 {
    0.8
}

fn default_sigma_threshold() -> f64 {
    3.0
}

fn default_min_buckets() -> usize {
    2
}

fn default_cost_ttl_seconds() -> u64 {
    300
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_interval_seconds(),
            run_on_start: true,
            duplicates: DuplicatesConfig::default(),
            cache_opportunities: CacheOpportunitiesConfig::default(),
            anomalies: AnomaliesConfig::default(),
            cost_rollup: CostRollupConfig::default(),
        }
    }
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            interval_seconds: None,
            window_minutes: default_duplicates_window_minutes(),
            limit: default_duplicates_limit(),
            ttl_seconds: default_analysis_ttl_seconds(),
            clear_after_empty_runs: None,
        }
    }
}

impl Default for CacheOpportunitiesConfig {
    fn default() -> Self {
        Self {
            interval_seconds: None,
            window_hours: default_window_hours(),
            min_requests: default_min_requests(),
            limit: default_cache_limit(),
            savings_factor: default_savings_factor(),
            ttl_seconds: default_analysis_ttl_seconds(),
            clear_after_empty_runs: None,
        }
    }
}

impl Default for AnomaliesConfig {
    fn default() -> Self {
        Self {
            interval_seconds: None,
            window_hours: default_window_hours(),
            sigma_threshold: default_sigma_threshold(),
            min_buckets: default_min_buckets(),
            ttl_seconds: default_analysis_ttl_seconds(),
            clear_after_empty_runs: None,
        }
    }
}

impl Default for CostRollupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: None,
            window_hours: default_window_hours(),
            ttl_seconds: default_cost_ttl_seconds(),
            publish_events: true,
        }
    }
}

impl AnalysisConfig {
    /// Cadence for the named job, falling back to the shared interval
    pub fn interval_for(&self, job_name: &str) -> Result<Duration, AppError> {
        let overridden = match job_name {
            DUPLICATES_JOB => self.duplicates.interval_seconds,
            CACHE_OPPORTUNITIES_JOB => self.cache_opportunities.interval_seconds,
            ANOMALIES_JOB => self.anomalies.interval_seconds,
            COST_ROLLUP_JOB => self.cost_rollup.interval_seconds,
            _ => return Err(AppError::NotFound(format!("Unknown job: {job_name}"))),
        };

        let seconds = overridden.unwrap_or(self.interval_seconds);
        if seconds == 0 {
            return Err(AppError::Internal(format!(
                "Job '{job_name}' interval must be greater than zero"
            )));
        }
        Ok(Duration::from_secs(seconds))
    }
}

/// Result of job execution
#[derive(Debug, Clone)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    pub items_processed: u64,
}

impl JobResult {
    pub fn success_with_count(count: u64) -> Self {
        Self {
            success: true,
            message: format!("Wrote artifact with {count} items"),
            items_processed: count,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            items_processed: 0,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            items_processed: 0,
        }
    }
}

/// An analysis job run by the scheduler.
///
/// A store error is returned as `Err` so the scheduler logs it and skips the
/// cycle; a cache write failure is reported as an unsuccessful `JobResult`.
#[async_trait]
pub trait Job: Send + Sync {
    /// Get the job name for logging and identification
    fn name(&self) -> &str;

    /// Execute one cycle of the job
    async fn execute(&self) -> Result<JobResult, AppError>;
}

/// What to do with an artifact after a run that produced no items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyRunAction {
    Write,
    Skip,
    Clear,
}

/// Counts consecutive empty runs for the retain/clear-after policy
#[derive(Debug)]
pub struct EmptyRunTracker {
    consecutive_empty: AtomicU32,
    clear_after: Option<u32>,
}

impl EmptyRunTracker {
    pub fn new(clear_after: Option<u32>) -> Self {
        Self {
            consecutive_empty: AtomicU32::new(0),
            clear_after,
        }
    }

    pub fn observe(&self, is_empty: bool) -> EmptyRunAction {
        if !is_empty {
            self.consecutive_empty.store(0, Ordering::Relaxed);
            return EmptyRunAction::Write;
        }

        let runs = self
            .consecutive_empty
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        match self.clear_after {
            Some(limit) if runs >= limit => EmptyRunAction::Clear,
            _ => EmptyRunAction::Skip,
        }
    }
}

/// Write an artifact, converting a cache failure into a failed `JobResult`
pub(crate) async fn write_artifact<T: CachedArtifact>(
    cache: &CacheManager,
    job: &str,
    artifact: &T,
    ttl: Duration,
    items: u64,
) -> JobResult {
    match cache.put_artifact(artifact, ttl).await {
        Ok(()) => {
            debug!(job, key = T::cache_key(), items, "Artifact written");
            JobResult::success_with_count(items)
        }
        Err(e) => {
            warn!(job, key = T::cache_key(), error = %e, "Dropping artifact write");
            crate::metrics::record_artifact_write_failure(T::cache_key());
            JobResult::failure(format!("Failed to write '{}': {}", T::cache_key(), e))
        }
    }
}

/// Apply the empty-run policy to a list result, then write its envelope if required
pub(crate) async fn publish_list_artifact<I>(
    cache: &CacheManager,
    tracker: &EmptyRunTracker,
    job: &str,
    items: Vec<I>,
    ttl: Duration,
) -> JobResult
where
    AnalysisArtifact<I>: CachedArtifact,
{
    let key = AnalysisArtifact::<I>::cache_key();
    match tracker.observe(items.is_empty()) {
        EmptyRunAction::Write => {
            let count = items.len() as u64;
            write_artifact(cache, job, &AnalysisArtifact::new(items), ttl, count).await
        }
        EmptyRunAction::Clear => {
            info!(job, key, "Clearing artifact after empty runs");
            write_artifact(cache, job, &AnalysisArtifact::<I>::cleared(), ttl, 0).await
        }
        EmptyRunAction::Skip => {
            debug!(job, key, "No results, keeping previous artifact");
            JobResult::success("No results, previous artifact retained")
        }
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build all analysis jobs over the shared store and cache
pub fn build_jobs(
    config: &AnalysisConfig,
    store: Arc<dyn RecordStore>,
    cache: CacheManager,
) -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(CostRollupJob::new(
            store.clone(),
            cache.clone(),
            config.cost_rollup.clone(),
        )),
        Arc::new(DuplicateDetectionJob::new(
            store.clone(),
            cache.clone(),
            config.duplicates.clone(),
        )),
        Arc::new(CacheOpportunityJob::new(
            store.clone(),
            cache.clone(),
            config.cache_opportunities.clone(),
        )),
        Arc::new(AnomalyDetectionJob::new(
            store,
            cache,
            config.anomalies.clone(),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = AnalysisConfig::default();
        for name in JOB_NAMES {
            assert_eq!(config.interval_for(name).unwrap(), Duration::from_secs(60));
        }
    }

    #[test]
    fn test_interval_override_and_unknown_job() {
        let mut config = AnalysisConfig::default();
        config.anomalies.interval_seconds = Some(300);
        assert_eq!(
            config.interval_for(ANOMALIES_JOB).unwrap(),
            Duration::from_secs(300)
        );
        assert!(matches!(
            config.interval_for("usage_cleanup"),
            Err(AppError::NotFound(_))
        ));

        config.interval_seconds = 0;
        assert!(config.interval_for(COST_ROLLUP_JOB).is_err());
    }

    #[test]
    fn test_empty_run_tracker_retains_by_default() {
        let tracker = EmptyRunTracker::new(None);
        assert_eq!(tracker.observe(true), EmptyRunAction::Skip);
        assert_eq!(tracker.observe(true), EmptyRunAction::Skip);
        assert_eq!(tracker.observe(false), EmptyRunAction::Write);
    }

    #[test]
    fn test_empty_run_tracker_clears_after_limit() {
        let tracker = EmptyRunTracker::new(Some(2));
        assert_eq!(tracker.observe(true), EmptyRunAction::Skip);
        assert_eq!(tracker.observe(true), EmptyRunAction::Clear);
        assert_eq!(tracker.observe(true), EmptyRunAction::Clear);

        // A non-empty run resets the streak
        assert_eq!(tracker.observe(false), EmptyRunAction::Write);
        assert_eq!(tracker.observe(true), EmptyRunAction::Skip);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(66.666_666), 66.67);
        assert_eq!(round2(50.0), 50.0);
        assert_eq!(round2(0.004), 0.0);
    }

    #[test]
    fn test_build_jobs_names() {
        let jobs = build_jobs(
            &AnalysisConfig::default(),
            Arc::new(crate::storage::MemoryRecordStore::new()),
            CacheManager::new_memory(),
        );
        let names: Vec<&str> = jobs.iter().map(|job| job.name()).collect();
        assert_eq!(names, JOB_NAMES.to_vec());
    }
}
