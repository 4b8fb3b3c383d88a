pub mod job;

use crate::Config;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run or inspect analysis jobs
    Job {
        #[command(subcommand)]
        command: job::JobCommand,
    },
}

pub async fn handle_command(
    command: Commands,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
    }
}
