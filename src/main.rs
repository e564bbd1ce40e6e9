use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flow_runner::config::Settings;
use flow_runner::http::server::{bootstrap, start_server};
use flow_runner::reaper::Reaper;

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 1;
/// Exit code when required infrastructure is unreachable on startup.
const EXIT_INFRA: i32 = 2;

#[derive(Parser)]
#[command(name = "flow-runner")]
#[command(version, about = "Task execution service for agent-flow artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP+WS endpoint and the worker set
    Server {
        /// Listen host (overrides FLOW_RUNNER_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides FLOW_RUNNER_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Number of workers (overrides FLOW_RUNNER_MAX_JOBS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Start workers only (shared database deployments)
    Worker {
        /// Number of workers (overrides FLOW_RUNNER_MAX_JOBS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run the periodic reconciler that reaps orphaned tasks
    Scheduler {
        /// Seconds between reconciler passes
        #[arg(long, default_value = "300")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLOW_RUNNER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let workers_override = match &cli.command {
        Commands::Server { host, port, workers } => {
            if let Some(host) = host {
                settings.host = host.clone();
            }
            if let Some(port) = port {
                settings.port = *port;
            }
            *workers
        }
        Commands::Worker { workers } => *workers,
        Commands::Scheduler { .. } => None,
    };
    if let Some(workers) = workers_override {
        if !(1..=100).contains(&workers) {
            tracing::error!(workers, "Worker count must be between 1 and 100");
            std::process::exit(EXIT_CONFIG);
        }
        settings.max_jobs = workers;
    }

    let state = match bootstrap(settings).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed, infrastructure unreachable");
            std::process::exit(EXIT_INFRA);
        }
    };

    let result = match cli.command {
        Commands::Server { .. } => {
            let workers = state.settings.max_jobs;
            start_server(state, workers).await
        }
        Commands::Worker { .. } => {
            let workers = state.settings.max_jobs;
            let handles = state.scheduler.spawn_workers(workers);
            tracing::info!(workers, "Worker set started");
            let wait = tokio::signal::ctrl_c().await;
            state.scheduler.shutdown().await;
            for handle in handles {
                let _ = handle.await;
            }
            wait.map_err(Into::into)
        }
        Commands::Scheduler { interval } => {
            let reaper = Reaper::new(
                state.db.clone(),
                state.bus.clone(),
                state.storage.clone(),
                state.settings.task_retention_days,
                state.settings.max_stream_size,
            );
            tracing::info!(interval, "Reconciler started");
            tokio::select! {
                _ = reaper.run_periodic(Duration::from_secs(interval)) => Ok(()),
                result = tokio::signal::ctrl_c() => result.map_err(Into::into),
            }
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Service error");
        std::process::exit(EXIT_INFRA);
    }
}
