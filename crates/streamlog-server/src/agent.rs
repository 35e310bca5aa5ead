//! Agent - assembles one streamlog node.
//!
//! The agent owns the node's single TCP listener and runs the
//! first-byte mux in front of it: connections opening with the
//! consensus sentinel go to the raft transport, everything else goes to
//! the gRPC server. It builds the replicated log, the dispatcher and
//! the membership bridge, and tears them down in order on shutdown.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use streamlog_cluster::membership::{self, MembershipEvent};
use streamlog_cluster::{ClusterConfig, ClusterError, DistributedLog, RAFT_RPC};
use streamlog_proto::v1::log_server::LogServer;
use streamlog_storage::SegmentConfig;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::service::LogService;

/// Configuration for one node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory for the user log and raft state.
    pub data_dir: PathBuf,
    /// Unique node name; doubles as the Raft identity.
    pub node_name: String,
    /// Address to bind the shared listener on; also advertised to peers
    /// and clients.
    pub rpc_addr: String,
    /// Bootstrap a single-voter cluster on first boot.
    pub bootstrap: bool,
    /// ACL policy file; absent means allow-all.
    pub acl_policy_file: Option<PathBuf>,
    /// Segment sizing for the logs.
    pub segment: SegmentConfig,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// A running streamlog node.
pub struct Agent {
    rpc_addr: SocketAddr,
    log: Arc<DistributedLog>,
    membership_tx: Option<mpsc::UnboundedSender<MembershipEvent>>,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Bind the listener, start the mux, the replicated log, the gRPC
    /// server and the membership bridge.
    pub async fn start(config: AgentConfig) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(&config.rpc_addr).await?;
        let rpc_addr = listener.local_addr()?;

        let (raft_tx, raft_rx) = mpsc::channel::<TcpStream>(64);
        let (rpc_tx, rpc_rx) = mpsc::channel::<io::Result<TcpStream>>(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(mux_loop(listener, raft_tx, rpc_tx, shutdown_rx.clone()));

        let cluster_config = ClusterConfig {
            node_name: config.node_name.clone(),
            rpc_addr: rpc_addr.to_string(),
            bootstrap: config.bootstrap,
            segment: config.segment.clone(),
            ..Default::default()
        };
        let log = Arc::new(DistributedLog::new(&config.data_dir, cluster_config, raft_rx).await?);

        let authorizer = match &config.acl_policy_file {
            Some(path) => Authorizer::from_policy_file(path)?,
            None => Authorizer::allow_all(),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let service = LogService::new(
            log.clone(),
            log.clone(),
            Arc::new(authorizer),
            shutdown.clone(),
        );

        let mut serve_shutdown = shutdown_rx.clone();
        let incoming = ReceiverStream::new(rpc_rx);
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(LogServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "rpc server exited");
            }
        });

        let (membership_tx, membership_rx) = mpsc::unbounded_channel();
        membership::spawn(log.clone(), config.node_name.clone(), membership_rx);

        info!(node = %config.node_name, addr = %rpc_addr, "agent started");
        Ok(Self {
            rpc_addr,
            log,
            membership_tx: Some(membership_tx),
            shutdown,
            shutdown_tx,
        })
    }

    /// The address the shared listener actually bound.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Channel the gossip collaborator delivers membership events on.
    pub fn membership_sender(&self) -> Option<mpsc::UnboundedSender<MembershipEvent>> {
        self.membership_tx.clone()
    }

    /// The node's replicated log.
    pub fn log(&self) -> Arc<DistributedLog> {
        self.log.clone()
    }

    /// Stop accepting work, then stop the servers and close the logs.
    /// Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(addr = %self.rpc_addr, "agent shutting down");

        // Ends the membership bridge.
        self.membership_tx = None;
        // Stops the mux and drains the RPC server.
        let _ = self.shutdown_tx.send(true);

        self.log.close().await?;
        Ok(())
    }
}

/// Accept connections and route them by their first byte: the consensus
/// sentinel goes to the raft transport, everything else to gRPC.
async fn mux_loop(
    listener: TcpListener,
    raft_tx: mpsc::Sender<TcpStream>,
    rpc_tx: mpsc::Sender<io::Result<TcpStream>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let raft_tx = raft_tx.clone();
                let rpc_tx = rpc_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_connection(stream, raft_tx, rpc_tx).await {
                        debug!(%peer, error = %e, "dropped connection");
                    }
                });
            }
        }
    }
}

async fn route_connection(
    mut stream: TcpStream,
    raft_tx: mpsc::Sender<TcpStream>,
    rpc_tx: mpsc::Sender<io::Result<TcpStream>>,
) -> io::Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Ok(());
    }
    if first[0] == RAFT_RPC {
        // Consume the sentinel; the consensus wire starts after it.
        stream.read_exact(&mut first).await?;
        let _ = raft_tx.send(stream).await;
    } else {
        let _ = rpc_tx.send(Ok(stream)).await;
    }
    Ok(())
}
