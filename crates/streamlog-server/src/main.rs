//! Streamlog node binary.
//!
//! Boots a single node: the shared listener, the replicated log and the
//! gRPC API. Logging is controlled through `RUST_LOG`.
//!
//! ```bash
//! # First node bootstraps the cluster
//! streamlog-server --data-dir /var/lib/streamlog/0 \
//!     --node-name node-0 --rpc-addr 127.0.0.1:8400 --bootstrap
//!
//! # Further nodes join through the membership layer
//! streamlog-server --data-dir /var/lib/streamlog/1 \
//!     --node-name node-1 --rpc-addr 127.0.0.1:8401
//! ```

use std::path::PathBuf;

use clap::Parser;
use streamlog_server::{Agent, AgentConfig};
use streamlog_storage::SegmentConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "streamlog-server", about = "Distributed append-only log node")]
struct Cli {
    /// Directory for log data and raft state.
    #[arg(long)]
    data_dir: PathBuf,

    /// Unique node name.
    #[arg(long)]
    node_name: String,

    /// Address to bind and advertise.
    #[arg(long, default_value = "127.0.0.1:8400")]
    rpc_addr: String,

    /// Bootstrap a single-voter cluster on first boot.
    #[arg(long)]
    bootstrap: bool,

    /// ACL policy file; omit to allow all callers.
    #[arg(long)]
    acl_policy_file: Option<PathBuf>,

    /// Segment store cap in bytes (0 = default).
    #[arg(long, default_value_t = 0)]
    max_store_bytes: u64,

    /// Segment index cap in bytes (0 = default).
    #[arg(long, default_value_t = 0)]
    max_index_bytes: u64,

    /// First offset of a fresh log.
    #[arg(long, default_value_t = 0)]
    initial_offset: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig {
        data_dir: cli.data_dir,
        node_name: cli.node_name,
        rpc_addr: cli.rpc_addr,
        bootstrap: cli.bootstrap,
        acl_policy_file: cli.acl_policy_file,
        segment: SegmentConfig {
            max_store_bytes: cli.max_store_bytes,
            max_index_bytes: cli.max_index_bytes,
            initial_offset: cli.initial_offset,
        },
    };

    let mut agent = Agent::start(config).await?;
    tracing::info!(addr = %agent.rpc_addr(), "node ready");

    tokio::signal::ctrl_c().await?;
    agent.shutdown().await?;
    Ok(())
}
