use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use iotistic_supervisor::docker::DockerRuntime;
use iotistic_supervisor::runtime::ContainerRuntime;
use iotistic_supervisor::state::SimpleState;
use iotistic_supervisor::store::SqliteStateStore;
use iotistic_supervisor::supervisor::{ConvergenceStatus, Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the supervisor database
    #[arg(long, default_value = "/var/lib/iotistic")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the convergence loop against the local container daemon
    Daemon {
        /// Seconds between convergence passes
        #[arg(long, default_value = "30")]
        poll_interval: u64,
        /// Grace period in seconds when stopping containers
        #[arg(long, default_value = "10")]
        stop_timeout: u64,
    },
    /// Submit a target state from a JSON file
    Apply {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show the per-service convergence report
    Status,
    /// Print recent logs of a managed service's container
    Logs {
        #[arg(long)]
        container_id: String,
        #[arg(long, default_value = "50")]
        tail: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let store = Arc::new(SqliteStateStore::new(&cli.data_dir).await?);

    match cli.command {
        Commands::Daemon {
            poll_interval,
            stop_timeout,
        } => {
            let runtime = Arc::new(DockerRuntime::connect().await?);
            let config = SupervisorConfig {
                poll_interval_secs: poll_interval,
                stop_timeout_secs: stop_timeout as u32,
                ..Default::default()
            };
            let supervisor = Arc::new(Supervisor::new(runtime, store, config));
            supervisor.start().await?;
        }

        Commands::Apply { file } => {
            let payload = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let state: SimpleState =
                serde_json::from_str(&payload).context("parsing target state")?;
            let runtime = Arc::new(DockerRuntime::connect().await?);
            let supervisor = Arc::new(Supervisor::new(runtime, store, SupervisorConfig::default()));
            supervisor.resync().await?;
            supervisor.set_target(state).await?;
            let results = supervisor.converge_once().await?;
            println!("applied target state, {} steps executed", results.len());
            for result in &results {
                println!("  {} -> {:?}", result.step, result.outcome);
            }
        }

        Commands::Status => {
            let runtime = Arc::new(DockerRuntime::connect().await?);
            let supervisor = Arc::new(Supervisor::new(runtime, store, SupervisorConfig::default()));
            supervisor.resync().await?;
            let reports = supervisor.service_report().await;
            if reports.is_empty() {
                println!("no services in target state");
            }
            for report in reports {
                let verdict = match &report.convergence {
                    ConvergenceStatus::Converged => "converged".to_string(),
                    ConvergenceStatus::Pending { next_retry_at, .. } => match next_retry_at {
                        Some(at) => format!("pending (next retry {})", at),
                        None => "pending".to_string(),
                    },
                    ConvergenceStatus::ExceededRetries { last_error } => {
                        format!("exceeded retries: {}", last_error)
                    }
                };
                println!(
                    "{}/{} [{}] {} {}",
                    report.app_id,
                    report.service_name,
                    report.status,
                    report.container_id.as_deref().unwrap_or("-"),
                    verdict
                );
            }
        }

        Commands::Logs { container_id, tail } => {
            let runtime = DockerRuntime::connect().await?;
            let lines = runtime
                .get_logs(&container_id, tail)
                .await
                .map_err(|e| anyhow::anyhow!("fetching logs: {}", e))?;
            for line in lines {
                println!("{}", line);
            }
        }
    }

    Ok(())
}
