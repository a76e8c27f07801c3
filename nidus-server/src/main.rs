//! `nidus`: run cluster nodes, or send one command to a node.
//!
//! ```text
//! nidus --config cluster.json node-0 node-1 node-2
//! nidus --leader 127.0.0.1:12000 SET bucket key value
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use nidus_common::config::load_config;
use nidus_common::error::NidusError;
use nidus_server::client::send_command;
use nidus_server::launch::start_node;
use nidus_server::wire::ClientReply;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nidus", version, about = "Replicated bucketed key-value store")]
#[command(group(ArgGroup::new("mode").required(true).args(["config", "leader"])))]
struct Cli {
    /// Cluster config (JSON); the positional arguments name the nodes to run
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node to send a command to (host:port); the positional arguments form the command
    #[arg(short, long)]
    leader: Option<String>,

    /// How long a client waits for the reply
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match (&cli.config, &cli.leader) {
        (Some(config), None) => run_nodes(config, &cli.args).await,
        (None, Some(leader)) => {
            run_client(leader, &cli.args, Duration::from_millis(cli.timeout_ms)).await
        }
        _ => bail!("use either --config or --leader"),
    }
}

async fn run_nodes(path: &Path, ids: &[String]) -> Result<()> {
    let cluster = load_config(path).with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&cluster.log_level);
    if ids.is_empty() {
        bail!(
            "name at least one node to run, e.g. {}",
            cluster.node_ids().join(" ")
        );
    }

    let cluster = Arc::new(cluster);
    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids {
        let node = start_node(id, cluster.clone())
            .await
            .with_context(|| format!("starting {}", id))?;
        nodes.push(node);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}

async fn run_client(addr: &str, words: &[String], timeout: Duration) -> Result<()> {
    init_tracing("warn");
    if words.is_empty() {
        bail!("no command given");
    }

    match send_command(addr, &words.join(" "), timeout).await {
        Ok(ClientReply::Result(text)) => println!("{}", text),
        Ok(ClientReply::NotLeader { leader: Some(to) }) => {
            println!("NotLeader: reconnect to {}", to)
        }
        Ok(ClientReply::NotLeader { leader: None }) => println!("NotLeader: leader unknown"),
        Ok(ClientReply::Failed(msg)) => println!("Failed: {}", msg),
        Err(NidusError::Timeout(_)) => println!("Timeout waiting for response"),
        Err(err) => return Err(err).with_context(|| format!("sending to {}", addr)),
    }
    Ok(())
}
