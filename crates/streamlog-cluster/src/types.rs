//! Type definitions for the OpenRaft integration.
//!
//! OpenRaft requires a type configuration naming the concrete types used
//! by the Raft implementation. This module defines streamlog's
//! configuration plus the aliases the rest of the crate works with.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::command::{CommandResponse, LogCommand};

/// Node ID type for the cluster.
///
/// Node names are strings; the Raft node id is derived from the name so
/// every member computes the same id for the same peer.
pub type NodeId = u64;

/// A member of the cluster as tracked in the Raft membership config.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerNode {
    /// The node's name.
    pub id: String,
    /// Address the node's RPC listener (and raft stream layer) is on.
    pub rpc_addr: String,
}

impl std::fmt::Display for ServerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.rpc_addr)
    }
}

// Use the declare_raft_types! macro to define the type configuration.
// This handles all the trait bounds and associated types correctly.
openraft::declare_raft_types!(
    /// OpenRaft type configuration for streamlog.
    pub TypeConfig:
        D = LogCommand,
        R = CommandResponse,
        Node = ServerNode,
);

/// Type alias for the Raft instance.
pub type ClusterRaft = openraft::Raft<TypeConfig>;

/// Type alias for a log entry.
pub type ClusterEntry = openraft::Entry<TypeConfig>;

/// Type alias for a vote.
pub type ClusterVote = openraft::Vote<NodeId>;

/// Type alias for a log ID.
pub type ClusterLogId = openraft::LogId<NodeId>;

/// Type alias for stored membership.
pub type ClusterStoredMembership = openraft::StoredMembership<NodeId, ServerNode>;

/// Type alias for snapshot metadata.
pub type ClusterSnapshotMeta = openraft::SnapshotMeta<NodeId, ServerNode>;

/// Type alias for a snapshot.
pub type ClusterSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for a storage error.
pub type ClusterStorageError = openraft::StorageError<NodeId>;

/// Type alias for a client write error.
pub type ClusterClientWriteError = openraft::error::ClientWriteError<NodeId, ServerNode>;

/// Type alias for a raft error carrying a client write error.
pub type ClusterRaftWriteError = openraft::error::RaftError<NodeId, ClusterClientWriteError>;

/// Derive the Raft node id for a node name: the first 8 big-endian bytes
/// of the name's SHA-256 digest.
pub fn node_id(name: &str) -> NodeId {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Information about the leader to re-route requests to.
#[derive(Debug, Clone)]
pub struct LeaderInfo {
    /// The leader's node ID.
    pub leader_id: NodeId,
    /// The leader's RPC address, when the membership knows it.
    pub leader_addr: Option<String>,
}

/// Extract forward-to-leader info from a client write error.
///
/// Returns `Some(LeaderInfo)` if the error is a ForwardToLeader error
/// with a known leader ID, `None` otherwise.
pub fn extract_forward_to_leader(error: &ClusterRaftWriteError) -> Option<LeaderInfo> {
    use openraft::error::RaftError;

    match error {
        RaftError::APIError(ClusterClientWriteError::ForwardToLeader(forward)) => {
            forward.leader_id.map(|leader_id| LeaderInfo {
                leader_id,
                leader_addr: forward.leader_node.as_ref().map(|n| n.rpc_addr.clone()),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_deterministic() {
        assert_eq!(node_id("node-0"), node_id("node-0"));
        assert_ne!(node_id("node-0"), node_id("node-1"));
    }

    #[test]
    fn test_server_node_display() {
        let node = ServerNode {
            id: "node-0".to_string(),
            rpc_addr: "127.0.0.1:8400".to_string(),
        };
        assert_eq!(node.to_string(), "node-0@127.0.0.1:8400");
    }
}
