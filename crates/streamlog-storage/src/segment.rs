//! Segment - one store/index pair.
//!
//! A segment owns a `<base>.store` and `<base>.index` file pair and hands
//! out offsets sequentially from `next_offset`. The log rolls to a new
//! segment once either file reaches its configured cap.
//!
//! Invariants:
//! - `next_offset >= base_offset`
//! - every record in the store has exactly one index entry, and entry `i`
//!   carries relative offset `i`
//! - `index.read(-1)` names the most recent record, which is how
//!   `next_offset` is recovered on reopen

use std::fs;
use std::path::Path;

use prost::Message;
use streamlog_proto::v1::Record;
use tracing::warn;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::index::{Index, ENT_WIDTH};
use crate::store::Store;

pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
}

impl Segment {
    /// Open or create the segment with the given base offset inside `dir`.
    ///
    /// An index file found at its full mapped size means the previous
    /// process never closed cleanly, so the tail is re-validated against
    /// the store before `next_offset` is recovered: entries whose record
    /// cannot be read back in full are discarded.
    pub fn open(dir: &Path, base_offset: u64, config: LogConfig) -> Result<Self> {
        let store = Store::open(dir.join(format!("{base_offset}.store")))?;
        let mut index = Index::open(dir.join(format!("{base_offset}.index")), &config)?;

        let suspect = index.size() % ENT_WIDTH != 0
            || (index.size() > 0 && index.size() == config.segment.max_index_bytes);
        if suspect {
            let valid = Self::validated_entries(&store, &index);
            if valid * ENT_WIDTH != index.size() {
                warn!(
                    base_offset,
                    entries = valid,
                    "discarding index tail past the store's last durable record"
                );
            }
            index.truncate_entries(valid);
        }

        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + rel as u64 + 1,
            Err(Error::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Count the leading index entries the store can actually serve.
    /// Entry `i` must carry relative offset `i` and point at a fully
    /// readable record; the first violation ends the scan.
    fn validated_entries(store: &Store, index: &Index) -> u64 {
        let mut valid = 0u64;
        loop {
            let (rel, pos) = match index.read(valid as i64) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            if rel as u64 != valid || store.read(pos).is_err() {
                break;
            }
            valid += 1;
        }
        valid
    }

    /// Append a record, stamping it with the next offset. The offset only
    /// advances after both the store and index writes succeed.
    pub fn append(&mut self, mut record: Record) -> Result<u64> {
        let cur = self.next_offset;
        record.offset = cur;
        let encoded = record.encode_to_vec();
        let (_, pos) = self.store.append(&encoded)?;
        self.index
            .write((self.next_offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(cur)
    }

    /// Read the record at an absolute offset.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let encoded = self.store.read(pos)?;
        Ok(Record::decode(encoded.as_slice())?)
    }

    /// True once the store or index has reached its cap; the log rolls to
    /// a fresh segment before the next append.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() >= self.config.segment.max_index_bytes
            || self.index.is_maxed()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Close the pair, index first so its truncation sync happens before
    /// the store flush.
    pub fn close(self) -> Result<()> {
        self.index.close()?;
        self.store.close()
    }

    /// Close the segment and delete both files.
    pub fn remove(self) -> Result<()> {
        let index_path = self.index.path().to_path_buf();
        let store_path = self.store.path().to_path_buf();
        self.close()?;
        fs::remove_file(index_path)?;
        fs::remove_file(store_path)?;
        Ok(())
    }
}
