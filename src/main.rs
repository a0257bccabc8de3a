use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use midrender::agent;
use midrender::config::NodeConfig;
use midrender::node::FarmNode;
use midrender::shutdown;

#[derive(Parser, Debug)]
#[command(name = "midrender")]
#[command(about = "Peer-to-peer render farm controller")]
struct Args {
    /// Local data directory (identity, config, leader database)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Shared filesystem mount the farm rendezvouses on
    #[arg(long)]
    sync_root: Option<String>,

    /// HTTP mesh port
    #[arg(long)]
    http_port: Option<u16>,

    /// Leader election priority (lower wins)
    #[arg(long)]
    priority: Option<i32>,

    /// Comma-separated node tags, e.g. "gpu,leader"
    #[arg(long)]
    tags: Option<String>,

    /// Start with the node in the stopped state
    #[arg(long)]
    stopped: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let config_path = data_dir.join("config.json");

    let mut config = NodeConfig::load(&config_path)?;
    if let Some(sync_root) = args.sync_root {
        config.sync_root = sync_root;
    }
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }
    if let Some(priority) = args.priority {
        config.priority = priority;
    }
    if let Some(tags) = args.tags {
        config.tags = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }
    if args.stopped {
        config.node_stopped = true;
    }
    config.save(&config_path)?;

    let auto_start_agent = config.auto_start_agent;
    let (node, agent_endpoint) = FarmNode::new(config, data_dir)?;
    tracing::info!(node_id = %node.node_id(), "starting midrender node");

    let (cancel, force) = shutdown::install_shutdown_handler();

    if auto_start_agent {
        tokio::spawn(agent::run(agent_endpoint, cancel.clone()));
    } else {
        tracing::info!("no render agent attached; this node coordinates but does not render");
        drop(agent_endpoint);
    }

    node.run(cancel, force).await?;
    Ok(())
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".midrender"))
        .unwrap_or_else(|| PathBuf::from(".midrender"))
}
