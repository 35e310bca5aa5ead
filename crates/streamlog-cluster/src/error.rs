//! Error types for the replicated log.
//!
//! ## Error Categories
//!
//! - **Routing**: `NotLeader` carries the leader's address (when known)
//!   so callers can re-route a write.
//! - **Bounds**: out-of-range reads surface through the `Storage` variant
//!   unchanged, keeping the attempted offset.
//! - **Systems**: I/O, serialization and consensus failures. These are
//!   not retried here; the RPC client owns retry policy.

use std::time::Duration;

use thiserror::Error;

use crate::types::{NodeId, ServerNode};

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for OpenRaft Raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;

/// Type alias for OpenRaft RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, ServerNode, RaftError<E>>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// A write landed on a follower. Carries the leader's address when
    /// the membership knows it.
    #[error("not leader; current leader is {leader_addr:?}")]
    NotLeader { leader_addr: Option<String> },

    /// Consensus did not commit the command before the deadline.
    #[error("commit timed out after {0:?}")]
    CommitTimeout(Duration),

    /// The local log engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] streamlog_storage::Error),

    /// The consensus layer failed.
    #[error("raft error: {0}")]
    Raft(String),

    /// Serialization of consensus state failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An underlying I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid node configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The node is shutting down.
    #[error("node is shutting down")]
    Shutdown,
}
