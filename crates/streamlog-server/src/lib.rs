//! Streamlog Server
//!
//! The node-facing half of streamlog: the gRPC dispatcher for the Log
//! service, the ACL authorizer behind its per-RPC checks, and the agent
//! that assembles a whole node (listener mux, replicated log, RPC
//! server, membership bridge).

pub mod agent;
pub mod auth;
pub mod service;

pub use agent::{Agent, AgentConfig, AgentError};
pub use auth::{AuthError, Authorizer};
pub use service::{CommitLog, LogService, ServerProvider};
