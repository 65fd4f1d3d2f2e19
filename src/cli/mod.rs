use std::path::PathBuf;

use clap::Parser;
use console::style;
use tokio::sync::mpsc;

use crate::config::RunConfig;
use crate::error::{FleetError, Result};
use crate::task::{ExecLog, TaskManager};

#[derive(Parser)]
#[command(name = "fleetcp")]
#[command(version)]
#[command(about = "Copy files and run commands on a fleet of hosts over SSH")]
#[command(long_about = "Reads a YAML run file, then uploads the listed files and runs the listed commands on every device, a bounded number of devices at a time.")]
pub struct Cli {
    /// Run file (YAML)
    #[arg(short = 'f', long, env = "FLEETCP_CONFIG")]
    pub config: PathBuf,

    /// Number of devices processed concurrently (overrides the run file)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = RunConfig::load(&self.config)?;

        let workers = self
            .workers
            .map(usize::from)
            .unwrap_or(config.workers);
        if workers == 0 {
            return Err(FleetError::Config("workers must be at least 1".to_string()));
        }

        // One result slot per worker
        let manager = TaskManager::new(
            config.conn_infos(),
            config.copy.clone(),
            config.execute.clone(),
        )
        .with_capacity(workers);
        let stream = manager
            .log_stream()
            .ok_or_else(|| FleetError::Config("result stream unavailable".to_string()))?;

        let (started, printed) = tokio::join!(manager.start(workers), print_logs(stream));
        started?;

        tracing::info!("Finished {} device(s)", printed);
        Ok(())
    }
}

/// Print each device's log as it arrives; returns how many were printed.
async fn print_logs(mut stream: mpsc::Receiver<ExecLog>) -> usize {
    let mut count = 0;

    while let Some(record) = stream.recv().await {
        println!("{}", style(format!("----{}----", record.device)).cyan().bold());
        if record.log.is_empty() {
            println!("{}", style("ok").green());
        } else {
            print!("{}", record.log);
            if !record.log.ends_with('\n') {
                println!();
            }
        }
        count += 1;
    }

    count
}
