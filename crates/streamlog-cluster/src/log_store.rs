//! Raft log storage backed by the segmented log engine.
//!
//! This implements OpenRaft's `RaftLogStorage` on top of a second
//! [`Log`](streamlog_storage::Log) kept under the node's `raft/`
//! subdirectory, so the consensus log gets the same durability story as
//! the user log (`<base>.store` / `<base>.index` segment pairs).
//!
//! ## Storage Layout
//!
//! ```text
//! raft/
//! ├── meta.json    # last purged log id + committed log id
//! ├── vote.json    # vote state (current term, voted for)
//! └── log/
//!     ├── 0.store  # serialized entries, one record each
//!     ├── 0.index
//!     └── ...
//! ```
//!
//! Entries are kept in an in-memory map for random-access reads and
//! mirrored into the backing log for durability; the backing log's
//! offsets track entry indexes. Raft's suffix truncation (conflict
//! resolution) rewrites the backing log from the surviving entries, and
//! purging drops whole leading segments.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError, Vote};
use serde::{Deserialize, Serialize};
use streamlog_proto::v1::{Record, RecordType};
use streamlog_storage::{Log, LogConfig};
use tokio::sync::RwLock;

use crate::error::{ClusterError, ClusterResult};
use crate::types::{ClusterEntry, ClusterLogId, ClusterStorageError, NodeId, TypeConfig};

/// Durable storage for Raft log entries and protocol metadata.
#[derive(Clone)]
pub struct RaftLogStore {
    inner: Arc<RwLock<LogStoreInner>>,
}

struct LogStoreInner {
    log: Log,
    entries: BTreeMap<u64, ClusterEntry>,
    vote: Option<Vote<NodeId>>,
    meta: LogMeta,
    meta_path: PathBuf,
    vote_path: PathBuf,
}

/// Metadata persisted beside the log: what has been purged and what is
/// known committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogMeta {
    last_purged: Option<ClusterLogId>,
    committed: Option<ClusterLogId>,
}

impl RaftLogStore {
    /// Open or create the raft log store under `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> ClusterResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let log = Log::open(dir.join("log"), config)?;
        let meta_path = dir.join("meta.json");
        let vote_path = dir.join("vote.json");

        let meta = read_json::<LogMeta>(&meta_path)?.unwrap_or_default();
        let vote = read_json::<Vote<NodeId>>(&vote_path)?;

        let mut entries = BTreeMap::new();
        let lowest = log.lowest_offset()?;
        let highest = log.highest_offset()?;
        for offset in lowest..=highest {
            let record = match log.read(offset) {
                Ok(record) => record,
                // An empty log reports lowest == highest == 0 with nothing
                // at offset 0.
                Err(streamlog_storage::Error::OffsetOutOfRange { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            let entry: ClusterEntry = serde_json::from_slice(&record.value)?;
            entries.insert(entry.log_id.index, entry);
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(LogStoreInner {
                log,
                entries,
                vote,
                meta,
                meta_path,
                vote_path,
            })),
        })
    }

    /// Flush the backing log and truncate its index files to their
    /// logical size.
    pub async fn close(&self) -> ClusterResult<()> {
        self.inner.read().await.log.close()?;
        Ok(())
    }
}

impl LogStoreInner {
    fn save_meta(&self) -> ClusterResult<()> {
        write_json(&self.meta_path, &self.meta)
    }

    /// Offset the backing log will assign next, or None when it holds no
    /// records.
    fn next_backing_offset(&self) -> ClusterResult<Option<u64>> {
        let lowest = self.log.lowest_offset()?;
        let highest = self.log.highest_offset()?;
        if highest == 0 && self.log.read(0).is_err() && lowest == 0 {
            return Ok(None);
        }
        Ok(Some(highest + 1))
    }

    fn append_entry(&mut self, entry: ClusterEntry) -> ClusterResult<()> {
        // Keep backing offsets aligned with entry indexes. A fresh (or
        // freshly truncated) log is rebased to the incoming index.
        if self.next_backing_offset()? != Some(entry.log_id.index) && self.entries.is_empty() {
            self.log.reset_to_offset(entry.log_id.index)?;
        }
        let record = Record {
            offset: 0,
            term: entry.log_id.leader_id.term,
            value: serde_json::to_vec(&entry)?.into(),
            record_type: RecordType::Append as i32,
        };
        self.log.append(record)?;
        self.entries.insert(entry.log_id.index, entry);
        Ok(())
    }

    /// Drop entries at and above `index`, rewriting the backing log from
    /// the survivors.
    fn truncate_entries(&mut self, index: u64) -> ClusterResult<()> {
        self.entries.split_off(&index);
        match self.entries.first_key_value() {
            Some((first, _)) => {
                self.log.reset_to_offset(*first)?;
                let survivors: Vec<ClusterEntry> = self.entries.values().cloned().collect();
                for entry in survivors {
                    let record = Record {
                        offset: 0,
                        term: entry.log_id.leader_id.term,
                        value: serde_json::to_vec(&entry)?.into(),
                        record_type: RecordType::Append as i32,
                    };
                    self.log.append(record)?;
                }
            }
            None => self.log.reset_to_offset(index)?,
        }
        Ok(())
    }

    /// Drop entries at and below `index`. The backing log sheds whole
    /// segments, so it may retain a few purged records at the front;
    /// `meta.last_purged` is what the protocol trusts.
    fn purge_entries(&mut self, log_id: ClusterLogId) -> ClusterResult<()> {
        let keep = self.entries.split_off(&(log_id.index + 1));
        self.entries = keep;
        self.log.truncate(log_id.index)?;
        if self.meta.last_purged.map_or(true, |purged| purged < log_id) {
            self.meta.last_purged = Some(log_id);
        }
        self.save_meta()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> ClusterResult<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> ClusterResult<()> {
    let data = serde_json::to_vec(value)?;
    fs::write(path, data)?;
    Ok(())
}

fn io_err(e: &ClusterError) -> StorageIOError<NodeId> {
    StorageIOError::write_logs(&std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Implementation of OpenRaft's log reader interface.
impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<ClusterEntry>, ClusterStorageError> {
        let inner = self.inner.read().await;
        let entries: Vec<ClusterEntry> =
            inner.entries.range(range).map(|(_, e)| e.clone()).collect();
        Ok(entries)
    }
}

/// Implementation of OpenRaft's log storage interface.
impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, ClusterStorageError> {
        let inner = self.inner.read().await;

        let last_log_id = inner.entries.values().last().map(|e| e.log_id);
        let last_purged_log_id = inner.meta.last_purged;
        let last_log_id = last_log_id.or(last_purged_log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<ClusterLogId>,
    ) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        inner.meta.committed = committed;
        inner.save_meta().map_err(|e| io_err(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<ClusterLogId>, ClusterStorageError> {
        let inner = self.inner.read().await;
        Ok(inner.meta.committed)
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        write_json(&inner.vote_path, vote).map_err(|e| {
            let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            StorageIOError::write_vote(&io)
        })?;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, ClusterStorageError> {
        let inner = self.inner.read().await;
        Ok(inner.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), ClusterStorageError>
    where
        I: IntoIterator<Item = ClusterEntry>,
    {
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.append_entry(entry).map_err(|e| io_err(&e))?;
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        inner.truncate_entries(log_id.index).map_err(|e| io_err(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: ClusterLogId) -> Result<(), ClusterStorageError> {
        let mut inner = self.inner.write().await;
        inner.purge_entries(log_id).map_err(|e| io_err(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
