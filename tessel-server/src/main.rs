//! Tessel cluster binary.
//!
//! Runs an in-process cluster of Tessel nodes connected by a
//! [`LocalNetwork`] until interrupted:
//!
//! ```bash
//! tessel-server --nodes 5 --voters 3 --index logs:3:1
//! ```
//!
//! With `--data-dir`, each node persists its cluster state and vote under
//! `<data-dir>/node-<id>` and reloads them on the next start. With
//! `--repository-dir`, cold-tier snapshots go to that directory instead of
//! memory.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tessel_core::NodeId;
use tessel_lifecycle::{
    FilesystemConfig, FilesystemRepository, InMemoryRepository, SnapshotRepository,
};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tessel_server::{tick_task, ApiError, IndexSpec, LocalNetwork, NodeConfig, SystemClock, TesselNode};

/// Delay between attempts to create the startup indices.
const CREATE_RETRY_MS: u64 = 500;

/// Attempts to create each startup index before giving up.
const CREATE_ATTEMPTS_MAX: u32 = 60;

/// In-process Tessel cluster.
#[derive(Parser, Debug)]
#[command(name = "tessel-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes.
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of master-eligible nodes, taken from the lowest ids.
    #[arg(long, default_value = "3")]
    voters: u64,

    /// Directory for persisted cluster state.
    /// If not specified, state is kept in memory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for cold-tier snapshots.
    /// If not specified, snapshots are kept in memory.
    #[arg(long)]
    repository_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Index to create once a master is elected, in format
    /// `name:primary_shards:replicas`. Can be specified multiple times.
    #[arg(long = "index", value_parser = parse_index)]
    indices: Vec<IndexSpec>,
}

/// Parses an index specification in format `name:primary_shards:replicas`.
fn parse_index(s: &str) -> Result<IndexSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "invalid index format '{s}', expected 'name:primary_shards:replicas'"
        ));
    }

    let name = parts[0];
    if name.is_empty() {
        return Err("index name cannot be empty".to_string());
    }
    let primary_shards: u32 = parts[1]
        .parse()
        .map_err(|_| format!("invalid primary shard count '{}' in index '{s}'", parts[1]))?;
    let replicas: u32 = parts[2]
        .parse()
        .map_err(|_| format!("invalid replica count '{}' in index '{s}'", parts[2]))?;

    Ok(IndexSpec::new(name, primary_shards, replicas))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.nodes == 0 || args.voters == 0 || args.voters > args.nodes {
        return Err(format!(
            "need 1 <= voters <= nodes, got voters={} nodes={}",
            args.voters, args.nodes
        )
        .into());
    }

    info!(
        nodes = args.nodes,
        voters = args.voters,
        data_dir = ?args.data_dir,
        repository_dir = ?args.repository_dir,
        "Starting Tessel cluster"
    );

    let repository: Arc<dyn SnapshotRepository> = match &args.repository_dir {
        Some(dir) => Arc::new(FilesystemRepository::open(FilesystemConfig::new(dir)).await?),
        None => Arc::new(InMemoryRepository::new(0)),
    };

    let network = LocalNetwork::new();
    let voters: Vec<NodeId> = (1..=args.voters).map(NodeId::new).collect();
    let mut nodes = Vec::new();
    let mut shutdown = Vec::new();

    for id in (1..=args.nodes).map(NodeId::new) {
        let mut config = NodeConfig::new(id, voters.clone());
        if let Some(dir) = &args.data_dir {
            config = config.with_data_dir(dir.join(format!("node-{}", id.get())));
        }
        let node = TesselNode::new(
            config,
            Arc::new(network.endpoint(id)),
            Arc::new(SystemClock),
            Arc::clone(&repository),
        )?;
        network.attach(id, node.handler());
        let version = node.recover().await?;
        info!(node = %id, version = %version, "node recovered");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(tick_task(node.clone(), rx));
        shutdown.push(tx);
        nodes.push(node);
    }

    if let Some(coordinator) = nodes.first() {
        for spec in &args.indices {
            create_with_retry(coordinator, spec).await;
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for tx in shutdown {
        let _ = tx.send(()).await;
    }
    Ok(())
}

/// Creates `spec`, waiting for a master to be elected.
async fn create_with_retry<C: tessel_server::ClusterTransport>(node: &TesselNode<C>, spec: &IndexSpec) {
    for _ in 0..CREATE_ATTEMPTS_MAX {
        match node
            .create_index(&spec.name, spec.primary_shards, spec.replicas, spec.policy.clone())
            .await
        {
            Ok(index) => {
                info!(index = %index, name = %spec.name, "Created index");
                return;
            }
            Err(ApiError::AlreadyExists { .. }) => {
                info!(name = %spec.name, "Index already exists");
                return;
            }
            Err(e) if e.is_retryable() => {
                tokio::time::sleep(Duration::from_millis(CREATE_RETRY_MS)).await;
            }
            Err(e) => {
                warn!(name = %spec.name, error = %e, "Index creation failed");
                return;
            }
        }
    }
    warn!(name = %spec.name, "Gave up creating index: no master");
}
