//! Control plane binary

use clap::{Parser, Subcommand};
use replikv::common::Config;
use replikv::ControlPlane;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "replikv-control")]
#[command(about = "replikv control plane: liveness, membership and routing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Worker URLs known at startup (comma-separated)
        #[arg(long, value_delimiter = ',')]
        workers: Vec<String>,

        /// Silence (ms) after which a worker is declared dead
        #[arg(long)]
        heartbeat_timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            workers,
            heartbeat_timeout_ms,
        } => {
            let mut control_config = config.control.unwrap_or_default();
            if let Some(bind) = bind {
                control_config.bind_addr = bind;
            }
            if !workers.is_empty() {
                control_config.workers = workers;
            }
            if let Some(timeout) = heartbeat_timeout_ms {
                control_config.heartbeat_timeout_ms = timeout;
            }

            ControlPlane::new(control_config).serve().await?;
        }
    }

    Ok(())
}
