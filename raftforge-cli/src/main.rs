//! RaftForge command line interface

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use raftforge::{
    ClusterConfig, FileLog, FileStable, Listener, Node, RaftNode, SnapshotStore, Storage,
    TcpDialer, TcpServerListener,
};
use raftforge_config::{ConfigLoader, RaftForgeConfig};
use raftforge_core::{RaftError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod kv;

#[derive(Parser)]
#[command(name = "raftforge")]
#[command(about = "RaftForge consensus node")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a node: record its identity and bootstrap the cluster
    /// configuration
    Init {
        /// Configuration file path
        #[arg(short, long, default_value = "raftforge.toml")]
        config: String,

        /// Cluster id (nonzero)
        #[arg(long)]
        cluster_id: u64,

        /// This node's id (nonzero)
        #[arg(long)]
        node_id: u64,

        /// Cluster members as `id=host:port`, repeatable; all start as
        /// voters
        #[arg(long = "member", required = true)]
        members: Vec<String>,
    },

    /// Start the node and serve peer RPCs
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "raftforge.toml")]
        config: String,
    },

    /// Print the persistent state of a node's data directory
    Status {
        /// Configuration file path
        #[arg(short, long, default_value = "raftforge.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { config, cluster_id, node_id, members } => {
            let config = load_config(&config)?;
            init_logging(&config);
            init(config, cluster_id, node_id, &members).await
        }
        Commands::Start { config } => {
            let config = load_config(&config)?;
            init_logging(&config);
            start(config).await
        }
        Commands::Status { config } => {
            let config = load_config(&config)?;
            status(config)
        }
    }
}

fn load_config(path: &str) -> Result<RaftForgeConfig> {
    if Path::new(path).exists() {
        ConfigLoader::new().load_from_file(path)
    } else {
        ConfigLoader::new().load()
    }
}

fn init_logging(config: &RaftForgeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_storage(data_dir: &Path) -> Result<Storage> {
    std::fs::create_dir_all(data_dir)?;
    let stable = FileStable::open(data_dir.join("vars"))?;
    let log = FileLog::open(data_dir.join("log"))?;
    let snaps = SnapshotStore::open(data_dir.join("snapshots"))?;
    Storage::open(Box::new(stable), Box::new(log), snaps)
}

fn parse_members(members: &[String]) -> Result<Vec<Node>> {
    members
        .iter()
        .map(|member| {
            let (id, addr) = member.split_once('=').ok_or_else(|| {
                RaftError::InvalidConfig(format!("member must be id=host:port, got {member}"))
            })?;
            let id = id.parse().map_err(|_| {
                RaftError::InvalidConfig(format!("invalid member id in {member}"))
            })?;
            Ok(Node::voter(id, addr))
        })
        .collect()
}

async fn init(
    config: RaftForgeConfig,
    cluster_id: u64,
    node_id: u64,
    members: &[String],
) -> Result<()> {
    let cluster = ClusterConfig::new(parse_members(members)?);
    cluster.validate()?;
    if !cluster.nodes.contains_key(&node_id) {
        return Err(RaftError::InvalidConfig(format!(
            "node {node_id} is not in the member list"
        )));
    }

    let mut storage = open_storage(&config.node.data_dir)?;
    storage.set_identity(cluster_id, node_id)?;
    storage.bootstrap(cluster).await?;

    info!(
        cluster_id,
        node_id,
        data_dir = %config.node.data_dir.display(),
        "node initialized"
    );
    Ok(())
}

async fn start(config: RaftForgeConfig) -> Result<()> {
    let storage = open_storage(&config.node.data_dir)?;
    let listener = TcpServerListener::bind(&config.node.bind_address).await?;
    info!(addr = %listener.local_addr(), "starting node");

    let node = RaftNode::start(
        config.raft.clone(),
        storage,
        Box::new(kv::KvStore::default()),
        Box::new(listener),
        Arc::new(TcpDialer),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

fn status(config: RaftForgeConfig) -> Result<()> {
    let data_dir: PathBuf = config.node.data_dir;
    let storage = open_storage(&data_dir)?;
    let (cluster_id, node_id) = storage.identity();
    let (last_index, last_term) = storage.last_log();

    println!("data dir:      {}", data_dir.display());
    println!("cluster id:    {cluster_id}");
    println!("node id:       {node_id}");
    println!("term:          {}", storage.term());
    println!("last log:      index {last_index}, term {last_term}");
    println!("latest config: index {}", storage.configs().latest.index);
    for node in storage.configs().latest.nodes.values() {
        println!(
            "  node {} at {} ({})",
            node.id,
            node.addr,
            if node.voter { "voter" } else { "nonvoter" }
        );
    }
    Ok(())
}
