//! Bridge from cluster-membership events to replication commands.
//!
//! The gossip collaborator (external to this crate) observes nodes
//! joining and leaving and delivers events on a channel; this bridge
//! translates them into voter changes on the replicated log. It is the
//! only component holding both the membership source and the replicated
//! log.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::distributed::DistributedLog;
use crate::error::ClusterError;

/// A membership change observed by the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join { id: String, rpc_addr: String },
    Leave { id: String },
}

/// Consume membership events until the channel closes.
///
/// Events about the local node are ignored, and "not leader" failures
/// are swallowed: followers simply record the member and rely on the
/// leader to converge the configuration.
pub fn spawn(
    log: Arc<DistributedLog>,
    local_name: String,
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let result = match &event {
                MembershipEvent::Join { id, rpc_addr } => {
                    if *id == local_name {
                        continue;
                    }
                    log.join(id, rpc_addr).await
                }
                MembershipEvent::Leave { id } => {
                    if *id == local_name {
                        continue;
                    }
                    log.leave(id).await
                }
            };
            match result {
                Ok(()) => {}
                Err(ClusterError::NotLeader { .. }) => {
                    debug!(?event, "ignoring membership change on follower");
                }
                Err(e) => {
                    error!(?event, error = %e, "failed to apply membership change");
                }
            }
        }
    })
}
