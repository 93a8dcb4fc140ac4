//! Storage node binary

use clap::{Parser, Subcommand};
use replikv::common::{Config, FailoverPolicy};
use replikv::StorageNode;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "replikv-node")]
#[command(about = "replikv storage node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a storage node
    Serve {
        /// Advertised base URL; also the node's identity
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Control plane URL
        #[arg(long)]
        control: Option<String>,

        /// Outbox file for async replication
        #[arg(long)]
        outbox: Option<PathBuf>,

        /// What failover does when a promotion cannot create replicas
        #[arg(long, value_parser = parse_policy)]
        failover_policy: Option<FailoverPolicy>,
    },
}

fn parse_policy(s: &str) -> Result<FailoverPolicy, String> {
    match s {
        "leave_degraded" => Ok(FailoverPolicy::LeaveDegraded),
        "drop_record" => Ok(FailoverPolicy::DropRecord),
        other => Err(format!(
            "unknown policy '{}', expected leave_degraded or drop_record",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File config first; CLI flags override it
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
            id,
            bind,
            control,
            outbox,
            failover_policy,
        } => {
            let mut node_config = config.node.unwrap_or_default();
            if let Some(id) = id {
                node_config.node_id = id;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind;
            }
            if let Some(control) = control {
                node_config.control_url = control;
            }
            if let Some(outbox) = outbox {
                node_config.outbox_path = outbox;
            }
            if let Some(policy) = failover_policy {
                node_config.replication.failover_policy = policy;
            }

            StorageNode::new(node_config).serve().await?;
        }
    }

    Ok(())
}
