use super::{AnalysisConfig, Job, JobResult};
use crate::error::AppError;
use std::{sync::Arc, time::Instant as StdInstant};
use tokio::{
    sync::{RwLock, broadcast, watch},
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior, interval_at},
};
use tracing::{error, info, warn};

/// Runs every analysis job on its own fixed cadence.
///
/// Each job gets one task whose loop awaits the run before waiting for the
/// next tick, so a job never overlaps itself; a slow run delays the next
/// tick instead of causing a burst of catch-up runs.
pub struct JobScheduler {
    config: AnalysisConfig,
    handles: Arc<RwLock<Vec<JoinHandle<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_coordinator: Option<watch::Receiver<bool>>,
}

impl JobScheduler {
    pub fn new(config: AnalysisConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            config,
            handles: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            shutdown_coordinator: None,
        }
    }

    /// Create JobScheduler with graceful shutdown integration
    pub fn with_shutdown_coordinator(
        config: AnalysisConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shutdown_coordinator: Some(shutdown_rx),
            ..Self::new(config)
        }
    }

    /// Start the job scheduler with registered jobs
    pub async fn start(&mut self, jobs: Vec<Arc<dyn Job>>) -> Result<(), AppError> {
        if !self.config.enabled {
            info!("Analysis scheduler disabled in configuration");
            return Ok(());
        }

        info!("Starting analysis scheduler with {} jobs", jobs.len());

        // Resolve every cadence before spawning so a bad config starts nothing
        let schedules = jobs
            .into_iter()
            .map(|job| {
                let period = self.config.interval_for(job.name())?;
                Ok((job, period))
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut handles = self.handles.write().await;
        for (job, period) in schedules {
            handles.push(self.spawn_job(job, period));
        }

        info!("Analysis scheduler started");
        Ok(())
    }

    /// Stop the scheduler, letting an in-flight run finish
    pub async fn stop(&mut self) {
        info!("Stopping analysis scheduler...");

        // Fails when every task already exited on the global shutdown signal;
        // their handles are still joined so a panicked task gets logged
        let _ = self.shutdown_tx.send(());

        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Job task failed during shutdown: {}", e);
            }
        }

        info!("Analysis scheduler stopped");
    }

    pub async fn running_jobs(&self) -> usize {
        self.handles
            .read()
            .await
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn spawn_job(&self, job: Arc<dyn Job>, period: Duration) -> JoinHandle<()> {
        let job_name = job.name().to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut coordinator_rx = self.shutdown_coordinator.clone();
        let first_tick = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + period
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Job '{}' scheduled every {:?}", job_name, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::execute_job(job.as_ref()).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Job '{}' received internal shutdown signal", job_name);
                        break;
                    }
                    _ = async {
                        if let Some(ref mut coord_rx) = coordinator_rx {
                            let _ = coord_rx.wait_for(|stop| *stop).await;
                        }
                    }, if coordinator_rx.is_some() => {
                        info!("Job '{}' received global shutdown signal", job_name);
                        break;
                    }
                }
            }

            info!("Job '{}' stopped", job_name);
        })
    }

    /// Run one cycle of a job, logging and recording its outcome.
    /// Returns `None` when the cycle was skipped because of an error.
    pub async fn execute_job(job: &dyn Job) -> Option<JobResult> {
        let job_name = job.name();
        let start = StdInstant::now();
        info!("Executing job '{}'", job_name);

        let outcome = job.execute().await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(result) => {
                if result.success {
                    info!(
                        job = job_name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Job completed: {}",
                        result.message
                    );
                    crate::metrics::record_job_run(job_name, "success", elapsed);
                } else {
                    warn!(job = job_name, "Job failed: {}", result.message);
                    crate::metrics::record_job_run(job_name, "failure", elapsed);
                }
                Some(result)
            }
            Err(e) => {
                error!(job = job_name, "Skipping cycle, previous artifact kept: {}", e);
                crate::metrics::record_job_run(job_name, "error", elapsed);
                None
            }
        }
    }
}
