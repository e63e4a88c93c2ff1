use anyhow::Result;
use clap::Parser;
use console::style;
use uuid::Uuid;

use conveyor_core::transport::JobStatusInfo;

use super::{load_config, logging};
use crate::runtime::Conveyor;

/// Show the stored status of a job.
#[derive(Parser)]
pub struct StatusCommand {
    /// Queue the job was dispatched to.
    #[arg(short, long)]
    pub queue: String,

    /// Job id.
    #[arg(short, long)]
    pub job_id: String,

    /// A specific dispatch. Defaults to the most recent one.
    #[arg(short, long)]
    pub dispatch_id: Option<Uuid>,

    /// Print the raw status record as JSON.
    #[arg(long)]
    pub json: bool,

    /// Configuration file path.
    #[arg(short, long, env = "CONVEYOR_CONFIG", default_value = "conveyor.toml")]
    pub config: String,
}

impl StatusCommand {
    pub async fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;
        logging::init(&config.observability, false);

        let conveyor = Conveyor::builder()
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let queue = conveyor.queue(&self.queue);
        queue.start().await.map_err(|e| anyhow::anyhow!("{}", e))?;

        let info = queue.get_job_status(&self.job_id, self.dispatch_id).await;
        queue.stop().await.map_err(|e| anyhow::anyhow!("{}", e))?;

        match info {
            Some(info) if self.json => println!("{}", serde_json::to_string_pretty(&info)?),
            Some(info) => print!("{}", render(&info)),
            None => anyhow::bail!("No status for job '{}' in queue '{}'", self.job_id, self.queue),
        }
        Ok(())
    }
}

fn render(info: &JobStatusInfo) -> String {
    let mut out = format!(
        "  {} {}\n  dispatch   {}\n  status     {}\n  retries    {}\n  created    {}\n",
        style(&info.queue).dim(),
        style(&info.job_id).cyan(),
        info.dispatch_id,
        info.status.as_str(),
        info.retries,
        info.created_at.to_rfc3339(),
    );
    if let Some(at) = info.started_at {
        out.push_str(&format!("  started    {}\n", at.to_rfc3339()));
    }
    if let Some(at) = info.completed_at {
        out.push_str(&format!("  completed  {}\n", at.to_rfc3339()));
    }
    if let Some(error) = &info.error {
        out.push_str(&format!("  error      {}\n", style(error).red()));
    }
    out
}
