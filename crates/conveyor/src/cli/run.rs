use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use super::{load_config, logging};
use crate::runtime::Conveyor;

/// Run workers for every configured queue.
///
/// The stock binary has no job types registered, so every job it receives
/// is reported failed. Applications embed [`Conveyor`] and register their
/// jobs instead.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, env = "CONVEYOR_CONFIG", default_value = "conveyor.toml")]
    pub config: String,

    /// Worker processes to run (overrides config).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Verbose logging.
    #[arg(long)]
    pub dev: bool,
}

impl RunCommand {
    pub async fn execute(self) -> Result<()> {
        let mut config = load_config(&self.config)?;
        logging::init(&config.observability, self.dev);

        if let Some(workers) = self.workers {
            config.worker.count = workers;
        }

        println!();
        println!(
            "  {} v{}  broker: {}",
            style("conveyor").bold().cyan(),
            env!("CARGO_PKG_VERSION"),
            style(config.broker.kind.as_str()).green()
        );
        println!();

        info!(config = %self.config, "Loaded configuration");

        let conveyor = Conveyor::builder()
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        conveyor.run().await.map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(())
    }
}
