//! CLI for cluster operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "replikv")]
#[command(about = "replikv key-value store CLI")]
#[command(version)]
struct Cli {
    /// Control plane URL
    #[arg(long, default_value = "http://localhost:7000")]
    control: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a value
    Put {
        key: String,
        value: String,
    },

    /// Read a value
    Get {
        key: String,
    },

    /// Show membership and worker liveness
    Cluster,

    /// Dump a node's records and membership view
    Status {
        /// Storage node URL
        #[arg(long)]
        node: String,
    },
}

async fn check(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let reason = body["error"].as_str().unwrap_or("no details");
        bail!("{}: {}", status, reason);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let control = cli.control.trim_end_matches('/');

    match cli.command {
        Commands::Put { key, value } => {
            let resp = client
                .post(format!("{}/put", control))
                .json(&json!({ "key": key, "value": value }))
                .send()
                .await
                .context("control plane unreachable")?;
            let body = check(resp).await?;
            println!("PUT {} ok", key);
            println!("  primary: {}", body["topology"]["primary"]);
            println!("  sync:    {}", body["topology"]["sync"]);
            println!("  async:   {}", body["topology"]["async"]);
        }

        Commands::Get { key } => {
            let resp = client
                .post(format!("{}/get", control))
                .json(&json!({ "key": key }))
                .send()
                .await
                .context("control plane unreachable")?;
            let body = check(resp).await?;
            println!("{}", body["value"].as_str().unwrap_or_default());
            eprintln!("(from {} as {})", body["source"], body["role"]);
        }

        Commands::Cluster => {
            let resp = client
                .get(format!("{}/cluster", control))
                .send()
                .await
                .context("control plane unreachable")?;
            let body = check(resp).await?;
            println!("Membership v{}", body["version"]);
            if let Some(workers) = body["workers"].as_array() {
                for w in workers {
                    println!(
                        "  {:<32} {:<8} last heartbeat {} ms ago",
                        w["node"].as_str().unwrap_or("?"),
                        w["state"].as_str().unwrap_or("?"),
                        w["last_heartbeat_ms_ago"]
                    );
                }
            }
            println!("Indexed keys: {}", body["indexed_keys"]);
        }

        Commands::Status { node } => {
            let resp = client
                .get(format!("{}/status", node.trim_end_matches('/')))
                .send()
                .await
                .with_context(|| format!("{} unreachable", node))?;
            let body = check(resp).await?;
            println!("Node {}", body["node"]);
            println!("  membership v{}", body["membership"]["version"]);
            println!("  async pending: {}", body["async_pending"]);
            if let Some(records) = body["records"].as_array() {
                for r in records {
                    println!(
                        "  {:<24} {:<8} primary={} sync={} async={}",
                        r["key"].as_str().unwrap_or("?"),
                        r["role"].as_str().unwrap_or("?"),
                        r["topology"]["primary"],
                        r["topology"]["sync"],
                        r["topology"]["async"]
                    );
                }
            }
        }
    }

    Ok(())
}
