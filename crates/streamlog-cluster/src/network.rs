//! Consensus networking over the shared stream layer.
//!
//! The client half implements OpenRaft's `RaftNetwork` by framing each
//! RPC over a cached TCP connection to the peer's stream layer. The
//! server half drains mux-routed connections and dispatches frames into
//! the local Raft instance.

use std::io;

use openraft::error::{InstallSnapshotError, NetworkError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::stream_layer::{self, RaftRequest, RaftResponse};
use crate::types::{ClusterRaft, NodeId, ServerNode, TypeConfig};
use crate::error::RPCError;

/// Factory creating framed connections to peers.
#[derive(Debug, Clone, Default)]
pub struct StreamNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for StreamNetworkFactory {
    type Network = StreamConnection;

    async fn new_client(&mut self, target: NodeId, node: &ServerNode) -> Self::Network {
        StreamConnection {
            target,
            addr: node.rpc_addr.clone(),
            stream: None,
        }
    }
}

/// A connection to one peer's stream layer. The TCP connection is dialed
/// lazily and dropped on any I/O failure so the next call redials.
pub struct StreamConnection {
    target: NodeId,
    addr: String,
    stream: Option<TcpStream>,
}

impl StreamConnection {
    async fn call(&mut self, request: &RaftRequest) -> io::Result<RaftResponse> {
        let stream = match self.stream.take() {
            Some(stream) => self.stream.insert(stream),
            None => {
                trace!(target = self.target, addr = %self.addr, "dialing peer");
                let stream = stream_layer::dial(&self.addr).await?;
                self.stream.insert(stream)
            }
        };

        let result = async {
            stream_layer::write_frame(stream, request).await?;
            stream_layer::read_frame::<RaftResponse>(stream).await
        }
        .await;

        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

fn to_network_error<E: std::error::Error>(err: &(impl std::error::Error + 'static)) -> RPCError<E> {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn to_unreachable_error<E: std::error::Error>(
    err: &(impl std::error::Error + 'static),
) -> RPCError<E> {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}

fn remote_error<E: std::error::Error>(message: String) -> RPCError<E> {
    let err = io::Error::new(io::ErrorKind::Other, message);
    to_network_error(&err)
}

fn unexpected_response<E: std::error::Error>() -> RPCError<E> {
    let err = io::Error::new(io::ErrorKind::InvalidData, "unexpected raft response kind");
    to_network_error(&err)
}

impl RaftNetwork<TypeConfig> for StreamConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError> {
        match self.call(&RaftRequest::AppendEntries(rpc)).await {
            Ok(RaftResponse::AppendEntries(resp)) => Ok(resp),
            Ok(RaftResponse::Error(message)) => Err(remote_error(message)),
            Ok(_) => Err(unexpected_response()),
            Err(e) => Err(to_unreachable_error(&e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        match self.call(&RaftRequest::InstallSnapshot(rpc)).await {
            Ok(RaftResponse::InstallSnapshot(resp)) => Ok(resp),
            Ok(RaftResponse::Error(message)) => Err(remote_error(message)),
            Ok(_) => Err(unexpected_response()),
            Err(e) => Err(to_unreachable_error(&e)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError> {
        match self.call(&RaftRequest::Vote(rpc)).await {
            Ok(RaftResponse::Vote(resp)) => Ok(resp),
            Ok(RaftResponse::Error(message)) => Err(remote_error(message)),
            Ok(_) => Err(unexpected_response()),
            Err(e) => Err(to_unreachable_error(&e)),
        }
    }
}

/// Serve consensus RPCs on connections routed in by the stream-layer
/// mux. Each connection gets its own task and handles frames in order.
pub(crate) fn spawn_raft_server(
    raft: ClusterRaft,
    mut incoming: mpsc::Receiver<TcpStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = incoming.recv().await {
            let raft = raft.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_peer(raft, stream).await {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        trace!("peer connection closed");
                    } else {
                        debug!(error = %e, "peer connection failed");
                    }
                }
            });
        }
    })
}

async fn serve_peer(raft: ClusterRaft, mut stream: TcpStream) -> io::Result<()> {
    loop {
        let request: RaftRequest = stream_layer::read_frame(&mut stream).await?;
        let response = match request {
            RaftRequest::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => RaftResponse::AppendEntries(resp),
                Err(e) => RaftResponse::Error(e.to_string()),
            },
            RaftRequest::Vote(req) => match raft.vote(req).await {
                Ok(resp) => RaftResponse::Vote(resp),
                Err(e) => RaftResponse::Error(e.to_string()),
            },
            RaftRequest::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => RaftResponse::InstallSnapshot(resp),
                Err(e) => RaftResponse::Error(e.to_string()),
            },
        };
        stream_layer::write_frame(&mut stream, &response).await?;
    }
}
