use crate::{
    Config,
    cache::CacheManager,
    jobs::{JOB_NAMES, JobScheduler, build_jobs},
    storage::StorageFactory,
};
use clap::Subcommand;
use tracing::info;

#[derive(Subcommand)]
pub enum JobCommand {
    /// Run one analysis job once and exit
    Run {
        #[arg(help = "Job name (see `job list`)")]
        job_name: String,
    },

    /// List analysis jobs and their cadence
    List,
}

pub async fn handle_job_command(
    command: JobCommand,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommand::Run { job_name } => {
            let store = StorageFactory::create_record_store(&config.store)?;
            let cache = CacheManager::new_from_config(&config.cache).await?;

            let job = build_jobs(&config.analysis, store, cache)
                .into_iter()
                .find(|job| job.name() == job_name)
                .ok_or_else(|| {
                    format!(
                        "Unknown job: {}. Available: {}",
                        job_name,
                        JOB_NAMES.join(", ")
                    )
                })?;

            info!("Running job: {}", job_name);
            match JobScheduler::execute_job(job.as_ref()).await {
                Some(result) if result.success => {
                    println!("{}: {}", job_name, result.message);
                }
                Some(result) => return Err(result.message.into()),
                None => return Err(format!("Job '{}' failed, see logs", job_name).into()),
            }
        }

        JobCommand::List => {
            println!("Available analysis jobs:");
            for name in JOB_NAMES {
                let interval = config.analysis.interval_for(name)?;
                println!("  {:<22} every {}s", name, interval.as_secs());
            }
            println!();
            println!("Example:");
            println!("  api-observatory job run {}", JOB_NAMES[0]);
        }
    }

    Ok(())
}
