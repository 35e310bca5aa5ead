//! The replicated state machine: committed commands applied to the user
//! log.
//!
//! Every node applies the same command sequence in the same order, so
//! the user logs converge byte for byte. Because the user log is itself
//! durable, the applied position is persisted after every batch
//! (`raft/fsm/meta.json`) - without it a restart would replay committed
//! entries into a log that already contains them.
//!
//! Snapshots capture the user log's byte stream (the concatenation of
//! every segment's store) plus the applied position, and are kept under
//! `raft/snapshots/`. Restoring resets the user log, seeds it with the
//! stream's first offset and re-appends every record in order.

use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::RaftStateMachine;
use openraft::{
    EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership,
};
use prost::Message;
use serde::{Deserialize, Serialize};
use streamlog_proto::v1::Record;
use streamlog_storage::Log;
use tokio::sync::{Notify, RwLock};

use crate::command::{CommandResponse, LogCommand};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{
    ClusterLogId, ClusterSnapshot, ClusterSnapshotMeta, ClusterStorageError,
    ClusterStoredMembership, TypeConfig,
};

/// State machine applying committed commands to the user log.
pub struct LogStateMachine {
    log: Arc<Log>,
    applied: RwLock<AppliedState>,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    snapshot_idx: AtomicU64,
    notify: Arc<Notify>,
    meta_path: PathBuf,
    snapshot_dir: PathBuf,
}

/// The durable applied position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedState {
    last_applied: Option<ClusterLogId>,
    membership: ClusterStoredMembership,
}

/// A snapshot as kept on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: ClusterSnapshotMeta,
    data: Vec<u8>,
}

impl LogStateMachine {
    /// Build the state machine over `log`, restoring applied state and
    /// the latest snapshot from `raft_dir` if present.
    pub fn open(log: Arc<Log>, raft_dir: impl Into<PathBuf>, notify: Arc<Notify>) -> ClusterResult<Self> {
        let raft_dir = raft_dir.into();
        let fsm_dir = raft_dir.join("fsm");
        let snapshot_dir = raft_dir.join("snapshots");
        fs::create_dir_all(&fsm_dir)?;
        fs::create_dir_all(&snapshot_dir)?;

        let meta_path = fsm_dir.join("meta.json");
        let applied = match fs::read(&meta_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppliedState::default(),
            Err(e) => return Err(e.into()),
        };

        let latest_path = snapshot_dir.join("latest.snap");
        let current_snapshot = match fs::read(&latest_path) {
            Ok(data) => Some(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            log,
            applied: RwLock::new(applied),
            current_snapshot: RwLock::new(current_snapshot),
            snapshot_idx: AtomicU64::new(0),
            notify,
            meta_path,
            snapshot_dir,
        })
    }

    fn persist_applied(&self, applied: &AppliedState) -> ClusterResult<()> {
        let data = serde_json::to_vec(applied)?;
        fs::write(&self.meta_path, data)?;
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: &StoredSnapshot) -> ClusterResult<()> {
        let data = serde_json::to_vec(snapshot)?;
        fs::write(self.snapshot_dir.join("latest.snap"), data)?;
        Ok(())
    }

    fn apply_command(&self, cmd: LogCommand, term: u64) -> ClusterResult<CommandResponse> {
        match cmd {
            LogCommand::Append { record } => {
                let mut record = Record::decode(record.as_slice())
                    .map_err(streamlog_storage::Error::from)?;
                record.term = term;
                let offset = self.log.append(record)?;
                self.notify.notify_waiters();
                Ok(CommandResponse {
                    offset: Some(offset),
                })
            }
            // Membership moves through the configuration-change protocol;
            // the command is accepted for wire compatibility only.
            LogCommand::JoinCluster { .. } => Ok(CommandResponse::default()),
        }
    }

    /// Re-seed the user log from a snapshot's byte stream: a sequence of
    /// `[u64 big-endian length][record]` entries in offset order.
    fn restore(&self, data: &[u8]) -> ClusterResult<()> {
        let mut cursor = Cursor::new(data);
        let mut len_buf = [0u8; 8];
        let mut first = true;
        loop {
            match cursor.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u64::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            cursor.read_exact(&mut payload)?;
            let record = Record::decode(payload.as_slice())
                .map_err(streamlog_storage::Error::from)?;
            if first {
                self.log.reset_to_offset(record.offset)?;
                first = false;
            }
            self.log.append(record)?;
        }
        if first {
            // Empty snapshot: just wipe the log.
            self.log.reset()?;
        }
        Ok(())
    }
}

fn sm_read_err(e: &ClusterError) -> StorageIOError<crate::types::NodeId> {
    let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
    StorageIOError::read_state_machine(&io)
}

fn sm_write_err(e: &ClusterError) -> StorageIOError<crate::types::NodeId> {
    let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
    StorageIOError::write_state_machine(&io)
}

/// Implementation of OpenRaft's snapshot builder interface.
impl RaftSnapshotBuilder<TypeConfig> for Arc<LogStateMachine> {
    async fn build_snapshot(&mut self) -> Result<ClusterSnapshot, ClusterStorageError> {
        let applied = self.applied.read().await.clone();

        let mut data = Vec::new();
        let mut reader = self.log.reader().map_err(|e| sm_read_err(&e.into()))?;
        reader
            .read_to_end(&mut data)
            .map_err(|e| sm_read_err(&ClusterError::Io(e)))?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = applied.last_applied {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{snapshot_idx}")
        };

        let meta = ClusterSnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership.clone(),
            snapshot_id,
        };

        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&snapshot)
            .map_err(|e| sm_write_err(&e))?;
        *self.current_snapshot.write().await = Some(snapshot);

        Ok(ClusterSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// Implementation of OpenRaft's state machine interface.
impl RaftStateMachine<TypeConfig> for Arc<LogStateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<ClusterLogId>, ClusterStoredMembership), ClusterStorageError> {
        let applied = self.applied.read().await;
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, ClusterStorageError>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + Send,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.write().await;

        for entry in entries {
            tracing::debug!(log_id = %entry.log_id, "applying to state machine");
            applied.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(CommandResponse::default()),
                EntryPayload::Normal(cmd) => {
                    let term = entry.log_id.leader_id.term;
                    let response = self
                        .apply_command(cmd, term)
                        .map_err(|e| sm_write_err(&e))?;
                    responses.push(response);
                }
                EntryPayload::Membership(membership) => {
                    applied.membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(CommandResponse::default());
                }
            }
        }

        self.persist_applied(&applied).map_err(|e| sm_write_err(&e))?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, ClusterStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &ClusterSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), ClusterStorageError> {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            snapshot_size = snapshot.get_ref().len(),
            "installing snapshot"
        );

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        self.restore(&stored.data).map_err(|e| sm_write_err(&e))?;

        let mut applied = self.applied.write().await;
        applied.last_applied = meta.last_log_id;
        applied.membership = meta.last_membership.clone();
        self.persist_applied(&applied).map_err(|e| sm_write_err(&e))?;
        drop(applied);

        self.persist_snapshot(&stored).map_err(|e| sm_write_err(&e))?;
        *self.current_snapshot.write().await = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<ClusterSnapshot>, ClusterStorageError> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(ClusterSnapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node_id;
    use openraft::CommittedLeaderId;
    use openraft::Entry;
    use streamlog_storage::LogConfig;
    use tempfile::TempDir;

    fn log_id(term: u64, index: u64) -> ClusterLogId {
        ClusterLogId::new(CommittedLeaderId::new(term, node_id("node-0")), index)
    }

    fn append_entry(index: u64, value: &str) -> Entry<TypeConfig> {
        let record = Record {
            value: value.as_bytes().to_vec().into(),
            ..Default::default()
        };
        Entry {
            log_id: log_id(1, index),
            payload: EntryPayload::Normal(LogCommand::Append {
                record: record.encode_to_vec(),
            }),
        }
    }

    fn open_machine(dir: &std::path::Path) -> (Arc<Log>, Arc<LogStateMachine>) {
        let log = Arc::new(Log::open(dir.join("log"), LogConfig::default()).expect("open log"));
        let sm = Arc::new(
            LogStateMachine::open(log.clone(), dir.join("raft"), Arc::new(Notify::new()))
                .expect("open state machine"),
        );
        (log, sm)
    }

    #[tokio::test]
    async fn test_apply_appends_to_user_log() {
        let dir = TempDir::new().expect("temp dir");
        let (log, sm) = open_machine(dir.path());
        let mut sm = sm;

        let responses = sm
            .apply(vec![append_entry(0, "a"), append_entry(1, "b")])
            .await
            .expect("apply");

        assert_eq!(responses[0].offset, Some(0));
        assert_eq!(responses[1].offset, Some(1));
        assert_eq!(
            log.read(1).expect("read").value,
            bytes::Bytes::from_static(b"b")
        );
        // Applied records carry the leader's term.
        assert_eq!(log.read(0).expect("read").term, 1);
    }

    #[tokio::test]
    async fn test_applied_state_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        {
            let (_log, sm) = open_machine(dir.path());
            let mut sm = sm;
            sm.apply(vec![append_entry(0, "a")]).await.expect("apply");
        }
        {
            let (_log, sm) = open_machine(dir.path());
            let mut sm = sm;
            let (last_applied, _) = sm.applied_state().await.expect("applied state");
            assert_eq!(last_applied, Some(log_id(1, 0)));
        }
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let (log, sm) = open_machine(dir.path());
        let mut sm = sm;

        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            sm.apply(vec![append_entry(i as u64, value)])
                .await
                .expect("apply");
        }
        let lowest = log.lowest_offset().expect("lowest");
        let highest = log.highest_offset().expect("highest");
        let before: Vec<Record> = (lowest..=highest)
            .map(|off| log.read(off).expect("read"))
            .collect();

        let snapshot = sm.build_snapshot().await.expect("build snapshot");

        // Wreck the user log, then restore from the snapshot.
        log.reset_to_offset(99).expect("reset");
        sm.install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .expect("install snapshot");

        assert_eq!(log.lowest_offset().expect("lowest"), lowest);
        assert_eq!(log.highest_offset().expect("highest"), highest);
        for (i, off) in (lowest..=highest).enumerate() {
            assert_eq!(log.read(off).expect("read"), before[i]);
        }
    }

    #[tokio::test]
    async fn test_install_empty_snapshot_resets_log() {
        let dir = TempDir::new().expect("temp dir");
        let (log, sm) = open_machine(dir.path());
        let mut sm = sm;

        let snapshot = sm.build_snapshot().await.expect("build snapshot");
        log.append(Record::default()).expect("append");
        sm.install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .expect("install snapshot");

        assert!(log.read(0).is_err());
    }
}
