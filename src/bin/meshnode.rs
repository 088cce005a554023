//! meshnode - tactical mesh node runner
//!
//! Usage:
//!   meshnode run [--data-dir ./data]        - Boot a node from the environment
//!   meshnode provision Alpha Bravo Charlie  - Generate mission keys
//!
//! `run` reads NODE_ID, BASE_PORT, PEERS, GOSSIP_INTERVAL, ZMQ_HWM,
//! ZMQ_RCV_TIMEOUT, TRUST_FILE_PATH and KEYS_PATH from the environment;
//! flags override where present.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tacmesh::config::MeshConfig;
use tacmesh::provision;
use tacmesh::types::NodeId;
use tacmesh::GossipEngine;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshnode", about = "Tactical mesh node", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a node from environment configuration
    Run {
        /// Override NODE_ID from the environment
        #[arg(long)]
        node_id: Option<String>,

        /// Directory for the store and cursor file
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
    /// Generate identity keys and the trust file for a set of nodes
    Provision {
        /// Node ids to provision
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Output directory
        #[arg(long, default_value = "./keys")]
        key_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Run { node_id, data_dir } => run(node_id, data_dir).await,
        Command::Provision { nodes, key_dir } => provision_keys(nodes, key_dir),
    }
}

async fn run(node_id: Option<String>, data_dir: PathBuf) -> Result<()> {
    if let Some(node_id) = node_id {
        std::env::set_var("NODE_ID", node_id);
    }

    let mut config = MeshConfig::from_env().context("configuration")?;
    config.data_dir = data_dir;

    let node = GossipEngine::start(config).await.context("boot")?;
    tracing::info!(node = %node.node_id(), "running, ctrl-c to stop");

    signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("shutting down");
    node.stop().await;
    Ok(())
}

fn provision_keys(nodes: Vec<String>, key_dir: PathBuf) -> Result<()> {
    let nodes: Vec<NodeId> = nodes.into_iter().map(NodeId::new).collect();
    let trust = provision::generate_mission_keys(&nodes, &key_dir).context("provisioning")?;

    println!("Provisioned {} identities under {}", trust.len(), key_dir.display());
    println!("  trust file: {}", provision::trust_path(&key_dir).display());
    for node in trust.keys() {
        println!("  identity:   {}", provision::identity_path(&key_dir, node).display());
    }
    Ok(())
}
