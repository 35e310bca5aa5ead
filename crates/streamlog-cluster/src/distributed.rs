//! The replicated log: the local log engine wrapped behind Raft.
//!
//! Appends are marshaled into commands and submitted to the consensus
//! node; once committed, the state machine applies them to the local
//! user log on every replica and the leader returns the assigned offset.
//! Reads bypass replication entirely and serve straight from the local
//! log - consumers that need linearizable reads must route to the
//! leader.
//!
//! ## Data-directory layout
//!
//! ```text
//! <data-dir>/
//! ├── log/          # user log segments
//! └── raft/
//!     ├── log/      # consensus log segments
//!     ├── meta.json
//!     ├── vote.json
//!     ├── fsm/      # applied position
//!     └── snapshots/
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openraft::error::InitializeError;
use openraft::{Config, Raft};
use prost::Message;
use streamlog_proto::v1::{Record, Server};
use streamlog_storage::{Log, LogConfig, SegmentConfig};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::command::LogCommand;
use crate::error::{ClusterError, ClusterResult};
use crate::fsm::LogStateMachine;
use crate::log_store::RaftLogStore;
use crate::network::{spawn_raft_server, StreamNetworkFactory};
use crate::types::{
    extract_forward_to_leader, node_id, ClusterRaft, ClusterRaftWriteError, NodeId, ServerNode,
};

/// Configuration for one replicated-log node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node name; the Raft identity derives from it.
    pub node_name: String,
    /// Address peers dial for consensus traffic; also advertised to
    /// clients via `GetServers`.
    pub rpc_addr: String,
    /// Bootstrap a single-voter cluster on first boot.
    pub bootstrap: bool,
    /// Segment sizing for the user log (the raft log uses the same).
    pub segment: SegmentConfig,
    /// Deadline for a submitted command to commit and apply.
    pub apply_timeout: Duration,
    /// How long a bootstrap node waits to win its own election.
    pub leader_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            rpc_addr: String::new(),
            bootstrap: false,
            segment: SegmentConfig::default(),
            apply_timeout: Duration::from_secs(10),
            leader_timeout: Duration::from_secs(3),
        }
    }
}

/// A log whose appends are ordered cluster-wide by Raft.
pub struct DistributedLog {
    node_id: NodeId,
    config: ClusterConfig,
    log: Arc<Log>,
    raft_log: RaftLogStore,
    raft: ClusterRaft,
    notify: Arc<Notify>,
}

impl DistributedLog {
    /// Assemble the node: user log, consensus log, state machine, raft
    /// instance and the server half of the consensus transport.
    /// `raft_incoming` carries connections the stream-layer mux matched
    /// as consensus traffic.
    ///
    /// With `bootstrap` set, the node initializes a single-voter cluster
    /// of itself (a no-op if it already has state) and blocks until it
    /// wins leadership.
    pub async fn new(
        data_dir: &Path,
        config: ClusterConfig,
        raft_incoming: mpsc::Receiver<TcpStream>,
    ) -> ClusterResult<Self> {
        if config.node_name.is_empty() {
            return Err(ClusterError::Config("node_name must be set".to_string()));
        }
        let id = node_id(&config.node_name);

        let log_config = LogConfig {
            segment: config.segment.clone(),
        };
        let log = Arc::new(Log::open(data_dir.join("log"), log_config.clone())?);
        let notify = Arc::new(Notify::new());

        let raft_dir = data_dir.join("raft");
        let state_machine = Arc::new(LogStateMachine::open(
            log.clone(),
            &raft_dir,
            notify.clone(),
        )?);
        let log_store = RaftLogStore::open(&raft_dir, log_config)?;

        let raft_config = Config {
            cluster_name: "streamlog".to_string(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        let raft = Raft::new(
            id,
            raft_config,
            StreamNetworkFactory,
            log_store.clone(),
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Raft(format!("failed to start raft: {e:?}")))?;

        spawn_raft_server(raft.clone(), raft_incoming);

        let distributed = Self {
            node_id: id,
            config,
            log,
            raft_log: log_store,
            raft,
            notify,
        };

        if distributed.config.bootstrap {
            distributed.bootstrap().await?;
            distributed
                .wait_for_leader(distributed.config.leader_timeout)
                .await?;
        }

        info!(
            node = %distributed.config.node_name,
            addr = %distributed.config.rpc_addr,
            "replicated log started"
        );
        Ok(distributed)
    }

    /// Initialize a single-voter cluster of this node. Restarting an
    /// already-bootstrapped node is a no-op.
    async fn bootstrap(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            ServerNode {
                id: self.config.node_name.clone(),
                rpc_addr: self.config.rpc_addr.clone(),
            },
        );
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(openraft::error::RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
            Err(e) => Err(ClusterError::Raft(e.to_string())),
        }
    }

    /// Submit a record for replicated append. Returns the offset the
    /// state machine assigned, or `NotLeader` with the leader's address
    /// when called on a follower.
    pub async fn append(&self, record: Record) -> ClusterResult<u64> {
        let command = LogCommand::Append {
            record: record.encode_to_vec(),
        };
        let write = tokio::time::timeout(
            self.config.apply_timeout,
            self.raft.client_write(command),
        )
        .await
        .map_err(|_| ClusterError::CommitTimeout(self.config.apply_timeout))?;

        match write {
            Ok(response) => response
                .data
                .offset
                .ok_or_else(|| ClusterError::Raft("append applied without an offset".to_string())),
            Err(e) => Err(classify_write_error(e)),
        }
    }

    /// Read the record at `offset` from the local log. Not linearizable
    /// by design.
    pub fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(self.log.read(offset)?)
    }

    /// Lowest offset held by the local log.
    pub fn lowest_offset(&self) -> ClusterResult<u64> {
        Ok(self.log.lowest_offset()?)
    }

    /// Highest offset held by the local log.
    pub fn highest_offset(&self) -> ClusterResult<u64> {
        Ok(self.log.highest_offset()?)
    }

    /// Notifier signaled after every applied append; consumers tailing
    /// the log park on it instead of polling.
    pub fn subscribe(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Add `name` as a voter. Must run on the leader; followers get
    /// `NotLeader`.
    pub async fn join(&self, name: &str, rpc_addr: &str) -> ClusterResult<()> {
        let joining = node_id(name);
        let node = ServerNode {
            id: name.to_string(),
            rpc_addr: rpc_addr.to_string(),
        };

        self.raft
            .add_learner(joining, node, true)
            .await
            .map_err(classify_write_error)?;

        let mut voters = self.voter_ids();
        if !voters.insert(joining) {
            return Ok(());
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(classify_write_error)?;

        info!(node = name, addr = rpc_addr, "node joined the cluster");
        Ok(())
    }

    /// Remove `name` from the voter set. Must run on the leader.
    pub async fn leave(&self, name: &str) -> ClusterResult<()> {
        let leaving = node_id(name);
        let mut voters = self.voter_ids();
        if !voters.remove(&leaving) {
            return Ok(());
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(classify_write_error)?;

        info!(node = name, "node left the cluster");
        Ok(())
    }

    /// Poll until some node holds leadership or the deadline passes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.raft.current_leader().await.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Raft(format!(
                    "no leader elected within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// True when this node currently holds leadership.
    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.node_id)
    }

    /// Cluster membership with the current leader tagged.
    pub fn get_servers(&self) -> ClusterResult<Vec<Server>> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;
        let mut servers: Vec<Server> = metrics
            .membership_config
            .nodes()
            .map(|(id, node)| Server {
                id: node.id.clone(),
                rpc_addr: node.rpc_addr.clone(),
                is_leader: Some(*id) == leader,
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// Step down gracefully, shut down the consensus node and close
    /// both logs. New appends fail once this returns.
    pub async fn close(&self) -> ClusterResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("raft shutdown: {e:?}")))?;
        self.raft_log.close().await?;
        self.log.close()?;
        Ok(())
    }
}

fn classify_write_error(error: ClusterRaftWriteError) -> ClusterError {
    match extract_forward_to_leader(&error) {
        Some(leader) => ClusterError::NotLeader {
            leader_addr: leader.leader_addr,
        },
        None => ClusterError::Raft(error.to_string()),
    }
}
