mod logging;
mod migrate;
mod run;
mod status;

pub use migrate::MigrateCommand;
pub use run::RunCommand;
pub use status::StatusCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conveyor_core::config::ConveyorConfig;

/// Conveyor - distributed job queues
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run workers for every configured queue.
    Run(RunCommand),

    /// Apply the broker schema.
    Migrate(MigrateCommand),

    /// Show the stored status of a job.
    Status(StatusCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Status(cmd) => cmd.execute().await,
        }
    }
}

/// Load a config file, failing with a hint when it is missing.
pub(crate) fn load_config(path: &str) -> Result<ConveyorConfig> {
    if !Path::new(path).exists() {
        anyhow::bail!(
            "Configuration file not found: {}\nPass --config or set CONVEYOR_CONFIG.",
            path
        );
    }
    ConveyorConfig::from_file(path).map_err(|e| anyhow::anyhow!("{}", e))
}
