//! Append-only store file.
//!
//! The store is the byte file that holds serialized records. Entries are
//! laid out back to back with a length prefix so records stay opaque and
//! a reader can skip an entry in O(1):
//!
//! ```text
//! ┌────────────────┬───────────────────┬────────────────┬─────────┐
//! │ len (8, BE)    │ payload (len)     │ len (8, BE)    │ ...     │
//! └────────────────┴───────────────────┴────────────────┴─────────┘
//! ```
//!
//! Writes go through a buffered writer to amortize syscalls; every read
//! path flushes the buffer first so a process always reads its own
//! writes. The store never interprets payload bytes - framing and
//! positions are the whole contract.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

/// Width of the big-endian length prefix written before every entry.
pub(crate) const LEN_WIDTH: u64 = 8;

/// An append-only, length-prefixed byte file.
///
/// All operations serialize on an internal mutex: appends share the
/// buffered-writer state, and reads must flush it before seeking.
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    writer: BufWriter<File>,
    reader: File,
    size: u64,
}

impl Store {
    /// Open or create the store file at `path`, picking up the size of
    /// whatever is already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let reader = file.try_clone()?;
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                writer: BufWriter::new(file),
                reader,
                size,
            }),
        })
    }

    /// Append `p` as one entry. Returns the number of bytes written
    /// (including the length prefix) and the position the entry starts at.
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.writer.write_all(&(p.len() as u64).to_be_bytes())?;
        inner.writer.write_all(p)?;
        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the entry starting at `pos`. The caller guarantees `pos` is a
    /// valid entry start, normally by going through the index.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner.reader.seek(SeekFrom::Start(pos))?;
        inner.reader.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);
        let mut payload = vec![0u8; len as usize];
        inner.reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Positional read of raw bytes into `buf`, returning how many bytes
    /// were read. Used by the bulk stream reader.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.reader.seek(SeekFrom::Start(off))?;
        Ok(inner.reader.read(buf)?)
    }

    /// Total bytes written, length prefixes included.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An independent sequential reader over the bytes present right now.
    /// Appends after this call are not visible through the returned
    /// reader.
    pub fn reader(&self) -> Result<std::io::Take<File>> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let file = File::open(&self.path)?;
        Ok(file.take(inner.size))
    }

    /// Flush buffered writes and sync the file to disk.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"hello world";

    fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("create temp dir");
        let store = Store::open(dir.path().join("0.store")).expect("open store");
        (dir, store)
    }

    // ---------------------------------------------------------------
    // Append / read round trips
    // ---------------------------------------------------------------

    #[test]
    fn test_append_returns_width_and_position() {
        let (_dir, store) = temp_store();
        for i in 0..4u64 {
            let (written, pos) = store.append(PAYLOAD).expect("append");
            assert_eq!(written, LEN_WIDTH + PAYLOAD.len() as u64);
            assert_eq!(pos, i * written);
        }
    }

    #[test]
    fn test_read_returns_appended_bytes() {
        let (_dir, store) = temp_store();
        let mut positions = Vec::new();
        for _ in 0..3 {
            let (_, pos) = store.append(PAYLOAD).expect("append");
            positions.push(pos);
        }
        for pos in positions {
            assert_eq!(store.read(pos).expect("read"), PAYLOAD);
        }
    }

    #[test]
    fn test_read_at_sees_length_prefix() {
        let (_dir, store) = temp_store();
        store.append(PAYLOAD).expect("append");

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut len_buf, 0).expect("read_at");
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(len_buf), PAYLOAD.len() as u64);
    }

    #[test]
    fn test_size_tracks_prefixed_entries() {
        let (_dir, store) = temp_store();
        assert_eq!(store.size(), 0);
        store.append(PAYLOAD).expect("append");
        store.append(PAYLOAD).expect("append");
        assert_eq!(store.size(), 2 * (LEN_WIDTH + PAYLOAD.len() as u64));
    }

    #[test]
    fn test_empty_payload() {
        let (_dir, store) = temp_store();
        let (written, pos) = store.append(&[]).expect("append");
        assert_eq!(written, LEN_WIDTH);
        assert!(store.read(pos).expect("read").is_empty());
    }

    // ---------------------------------------------------------------
    // Reopen
    // ---------------------------------------------------------------

    #[test]
    fn test_reopen_recovers_size() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("0.store");

        let store = Store::open(&path).expect("open store");
        let (_, pos) = store.append(PAYLOAD).expect("append");
        store.close().expect("close");
        drop(store);

        let reopened = Store::open(&path).expect("reopen store");
        assert_eq!(reopened.size(), LEN_WIDTH + PAYLOAD.len() as u64);
        assert_eq!(reopened.read(pos).expect("read"), PAYLOAD);
    }

    #[test]
    fn test_read_past_end_fails() {
        let (_dir, store) = temp_store();
        store.append(PAYLOAD).expect("append");
        assert!(store.read(store.size()).is_err());
    }

    // ---------------------------------------------------------------
    // Sequential reader
    // ---------------------------------------------------------------

    #[test]
    fn test_reader_is_bounded_at_construction() {
        use std::io::Read;

        let (_dir, store) = temp_store();
        store.append(PAYLOAD).expect("append");

        let mut reader = store.reader().expect("reader");
        store.append(PAYLOAD).expect("append after reader");

        let mut all = Vec::new();
        reader.read_to_end(&mut all).expect("read_to_end");
        assert_eq!(all.len() as u64, LEN_WIDTH + PAYLOAD.len() as u64);
    }
}
