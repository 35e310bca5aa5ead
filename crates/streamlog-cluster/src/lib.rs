//! Streamlog Cluster Layer
//!
//! Wraps the local log engine behind Raft consensus and bridges
//! cluster-membership events into voter changes.
//!
//! ## Architecture Overview
//!
//! ```text
//!            append                   committed entries
//! client ──► DistributedLog ──► Raft ──► LogStateMachine ──► Log
//!              │                 │
//!              │ read            │ AppendEntries / Vote / Snapshot
//!              ▼                 ▼
//!             Log         stream layer (shared TCP listener,
//!                          0x01 sentinel routes consensus)
//! ```
//!
//! ## Main Components
//!
//! - [`DistributedLog`]: the replicated log; same append/read contract
//!   as the local engine, but appends commit through leader election and
//!   log replication.
//! - [`RaftLogStore`]: the consensus log, durably backed by a second
//!   segmented log.
//! - [`LogStateMachine`]: applies committed appends to the user log and
//!   snapshots/restores it wholesale.
//! - [`membership`]: translates gossip join/leave events into
//!   `add voter` / `remove server` on the leader.
//! - [`stream_layer`]: the one-listener multiplexer shared with the RPC
//!   server, plus consensus framing.

pub mod command;
pub mod distributed;
pub mod error;
pub mod fsm;
pub mod log_store;
pub mod membership;
pub mod network;
pub mod stream_layer;
pub mod types;

pub use command::{CommandResponse, LogCommand};
pub use distributed::{ClusterConfig, DistributedLog};
pub use error::{ClusterError, ClusterResult};
pub use fsm::LogStateMachine;
pub use log_store::RaftLogStore;
pub use membership::MembershipEvent;
pub use stream_layer::RAFT_RPC;
pub use types::{node_id, NodeId, ServerNode};
