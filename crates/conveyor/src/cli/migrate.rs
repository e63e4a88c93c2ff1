use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use conveyor_core::config::BrokerKind;
use conveyor_runtime::migrations::{builtin_migrations, MigrationRunner};
use conveyor_runtime::transport::postgres::BrokerPool;

use super::{load_config, logging};

/// Apply the broker schema.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: Option<MigrateAction>,

    /// Configuration file path.
    #[arg(short, long, env = "CONVEYOR_CONFIG", default_value = "conveyor.toml", global = true)]
    pub config: String,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum MigrateAction {
    /// Apply pending migrations (default).
    Up,

    /// List applied and pending migrations.
    Status,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;
        logging::init(&config.observability, false);

        if config.broker.kind != BrokerKind::Postgres {
            println!(
                "  {} The {} broker has no schema",
                style("ℹ").blue(),
                config.broker.kind.as_str()
            );
            return Ok(());
        }

        let broker = BrokerPool::from_config(&config.broker)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let runner = MigrationRunner::new(broker.pool().clone());

        match self.action.unwrap_or(MigrateAction::Up) {
            MigrateAction::Up => {
                let applied = runner.run().await.map_err(|e| anyhow::anyhow!("{}", e))?;
                if applied.is_empty() {
                    println!("  {} Broker schema is up to date", style("✓").green());
                }
                for name in &applied {
                    println!("  {} Applied {}", style("✓").green(), style(name).cyan());
                }
            }
            MigrateAction::Status => {
                let applied = runner.applied().await.unwrap_or_default();
                for migration in builtin_migrations() {
                    if applied.contains(&migration.name) {
                        println!("  {} {}", style("✓").green(), migration.name);
                    } else {
                        println!("  {} {} (pending)", style("○").yellow(), migration.name);
                    }
                }
            }
        }

        broker.close().await;
        Ok(())
    }
}
