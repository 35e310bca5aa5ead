//! The log: an ordered list of segments.
//!
//! Appends go to the active (newest) segment and roll to a fresh one when
//! it maxes out; reads route to whichever segment covers the offset. On
//! startup the directory is scanned for `<base>.store` / `<base>.index`
//! pairs and every segment is reopened in base-offset order.
//!
//! Invariants while the log is open:
//! - segments are sorted by base offset ascending
//! - each segment starts where the previous one ended (truncation may
//!   later introduce a gap at the front)
//! - the active segment is always the last one

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use streamlog_proto::v1::Record;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::segment::Segment;

const DEFAULT_SEGMENT_BYTES: u64 = 1024;

/// A durable, segmented, append-only log of records.
///
/// Appends, truncation and reset take the write lock; reads, offset
/// queries and reader construction share the read lock. Segments need no
/// locking of their own because the log serializes writers and the store
/// flushes its buffer ahead of every read.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

struct LogInner {
    config: LogConfig,
    segments: Vec<Segment>,
}

impl Log {
    /// Open the log in `dir`, reloading any existing segments. Zero
    /// segment caps fall back to 1024 bytes.
    pub fn open(dir: impl AsRef<Path>, mut config: LogConfig) -> Result<Self> {
        if config.segment.max_store_bytes == 0 {
            config.segment.max_store_bytes = DEFAULT_SEGMENT_BYTES;
        }
        if config.segment.max_index_bytes == 0 {
            config.segment.max_index_bytes = DEFAULT_SEGMENT_BYTES;
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut inner = LogInner {
            config,
            segments: Vec::new(),
        };
        Self::setup(&dir, &mut inner)?;
        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    fn setup(dir: &Path, inner: &mut LogInner) -> Result<()> {
        let mut bases = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("store") {
                continue;
            }
            if let Some(base) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        for base in bases {
            inner
                .segments
                .push(Segment::open(dir, base, inner.config.clone())?);
        }
        if inner.segments.is_empty() {
            let base = inner.config.segment.initial_offset;
            inner
                .segments
                .push(Segment::open(dir, base, inner.config.clone())?);
        }
        Ok(())
    }

    /// Append a record to the active segment, rolling to a new segment
    /// once the active one maxes out. Returns the assigned offset.
    pub fn append(&self, record: Record) -> Result<u64> {
        let mut inner = self.inner.write();
        let active = inner.segments.last_mut().ok_or(Error::Closed)?;
        let offset = active.append(record)?;
        if active.is_maxed() {
            let config = inner.config.clone();
            inner
                .segments
                .push(Segment::open(&self.dir, offset + 1, config)?);
        }
        Ok(offset)
    }

    /// Read the record at `offset` from whichever segment covers it.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let inner = self.inner.read();
        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset());
        match segment {
            Some(segment) => segment.read(offset),
            None => Err(Error::OffsetOutOfRange { offset }),
        }
    }

    /// Base offset of the oldest segment.
    pub fn lowest_offset(&self) -> Result<u64> {
        let inner = self.inner.read();
        inner
            .segments
            .first()
            .map(Segment::base_offset)
            .ok_or(Error::Closed)
    }

    /// Offset of the most recent record, or 0 for a log that has never
    /// been appended to.
    pub fn highest_offset(&self) -> Result<u64> {
        let inner = self.inner.read();
        let next = inner
            .segments
            .last()
            .map(Segment::next_offset)
            .ok_or(Error::Closed)?;
        Ok(if next == 0 { 0 } else { next - 1 })
    }

    /// Remove every segment whose records all sit at or below `lowest`.
    /// The active segment always survives; truncating an empty log is a
    /// no-op.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let count = inner.segments.len();
        let mut kept = Vec::with_capacity(count);
        for (i, segment) in inner.segments.drain(..).enumerate() {
            if i + 1 < count && segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;
        Ok(())
    }

    /// A sequential reader over every segment's store bytes, in order.
    /// The view is pinned at construction: later appends are not visible.
    /// Used to ship consensus snapshots.
    pub fn reader(&self) -> Result<LogReader> {
        let inner = self.inner.read();
        let mut readers = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            readers.push(segment.store().reader()?);
        }
        Ok(LogReader {
            readers,
            current: 0,
        })
    }

    /// Close every segment, flushing stores and truncating index files to
    /// their logical size.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.drain(..) {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Wipe the log and recreate it empty at the configured initial
    /// offset.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.reset_locked(&mut inner)
    }

    /// Wipe the log and recreate it empty with `offset` as the first
    /// segment's base. Used when restoring from a snapshot whose stream
    /// starts mid-history.
    pub fn reset_to_offset(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.config.segment.initial_offset = offset;
        self.reset_locked(&mut inner)
    }

    fn reset_locked(&self, inner: &mut LogInner) -> Result<()> {
        for segment in inner.segments.drain(..) {
            segment.close()?;
        }
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        Self::setup(&self.dir, inner)
    }
}

/// Concatenated byte stream over the stores of every segment.
pub struct LogReader {
    readers: Vec<std::io::Take<fs::File>>,
    current: usize,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.readers.len() {
            let n = self.readers[self.current].read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.current += 1;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use bytes::Bytes;
    use prost::Message;
    use tempfile::TempDir;

    fn record(value: &str) -> Record {
        Record {
            value: Bytes::copy_from_slice(value.as_bytes()),
            ..Default::default()
        }
    }

    fn open_log(dir: &Path, segment: SegmentConfig) -> Log {
        Log::open(dir, LogConfig { segment }).expect("open log")
    }

    // ---------------------------------------------------------------
    // Append / read
    // ---------------------------------------------------------------

    #[test]
    fn test_append_read_round_trip() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());

        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            let offset = log.append(record(value)).expect("append");
            assert_eq!(offset, i as u64);
            assert_eq!(log.highest_offset().expect("highest"), offset);
        }
        assert_eq!(log.read(1).expect("read").value, Bytes::from_static(b"b"));
        assert_eq!(log.lowest_offset().expect("lowest"), 0);
        assert_eq!(log.highest_offset().expect("highest"), 2);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());
        log.append(record("a")).expect("append");

        match log.read(7) {
            Err(Error::OffsetOutOfRange { offset }) => assert_eq!(offset, 7),
            other => panic!("expected OffsetOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_initial_offset() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(
            dir.path(),
            SegmentConfig {
                initial_offset: 100,
                ..Default::default()
            },
        );
        assert_eq!(log.append(record("x")).expect("append"), 100);
        assert_eq!(log.lowest_offset().expect("lowest"), 100);
    }

    // ---------------------------------------------------------------
    // Segment rollover
    // ---------------------------------------------------------------

    #[test]
    fn test_rollover_when_store_fills_exactly() {
        let dir = TempDir::new().expect("create temp dir");
        let entry = 8 + record("0123456789").encode_to_vec().len() as u64;
        let log = open_log(
            dir.path(),
            SegmentConfig {
                max_store_bytes: entry,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        );

        assert_eq!(log.append(record("0123456789")).expect("append"), 0);
        // The first append filled the store exactly, so the second record
        // must land in a fresh segment based at the previous next offset.
        assert_eq!(log.append(record("0123456789")).expect("append"), 1);

        assert!(dir.path().join("0.store").exists());
        assert!(dir.path().join("0.index").exists());
        assert!(dir.path().join("1.store").exists());
        assert!(dir.path().join("1.index").exists());

        assert_eq!(log.read(0).expect("read").offset, 0);
        assert_eq!(log.read(1).expect("read").offset, 1);
    }

    // ---------------------------------------------------------------
    // Truncate
    // ---------------------------------------------------------------

    /// Ten records spread over segments based at [0, 4, 8]; truncate(5)
    /// removes only the first segment.
    #[test]
    fn test_truncate_removes_covered_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(
            dir.path(),
            SegmentConfig {
                max_store_bytes: 4096,
                max_index_bytes: 4 * 12,
                initial_offset: 0,
            },
        );
        let before: Vec<Record> = (0..10)
            .map(|i| {
                let offset = log.append(record(&format!("rec-{i}"))).expect("append");
                log.read(offset).expect("read")
            })
            .collect();
        assert!(dir.path().join("8.store").exists());

        log.truncate(5).expect("truncate");

        assert!(matches!(
            log.read(3),
            Err(Error::OffsetOutOfRange { offset: 3 })
        ));
        assert_eq!(log.read(7).expect("read"), before[7]);
        assert_eq!(log.lowest_offset().expect("lowest"), 4);
        assert!(!dir.path().join("0.store").exists());
    }

    #[test]
    fn test_truncate_empty_log_is_noop() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());
        log.truncate(10).expect("truncate");
        assert_eq!(log.lowest_offset().expect("lowest"), 0);
        log.append(record("still works")).expect("append");
    }

    #[test]
    fn test_truncate_preserves_active_segment() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(
            dir.path(),
            SegmentConfig {
                max_store_bytes: 4096,
                max_index_bytes: 2 * 12,
                initial_offset: 0,
            },
        );
        for i in 0..4 {
            log.append(record(&format!("{i}"))).expect("append");
        }
        // Truncating past the end must keep the active segment so appends
        // can continue.
        log.truncate(100).expect("truncate");
        let offset = log.append(record("after")).expect("append");
        assert_eq!(log.read(offset).expect("read").value, Bytes::from_static(b"after"));
    }

    // ---------------------------------------------------------------
    // Reader
    // ---------------------------------------------------------------

    #[test]
    fn test_reader_streams_length_prefixed_records() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());
        for value in ["one", "two", "three"] {
            log.append(record(value)).expect("append");
        }

        let mut reader = log.reader().expect("reader");
        let mut data = Vec::new();
        reader.read_to_end(&mut data).expect("read_to_end");

        let mut rest = data.as_slice();
        let mut decoded = Vec::new();
        while rest.len() >= 8 {
            let mut len_buf = [0u8; 8];
            len_buf.copy_from_slice(&rest[..8]);
            let len = u64::from_be_bytes(len_buf) as usize;
            decoded.push(Record::decode(&rest[8..8 + len]).expect("decode"));
            rest = &rest[8 + len..];
        }
        assert!(rest.is_empty());
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].value, Bytes::from_static(b"three"));
    }

    #[test]
    fn test_reader_view_pinned_at_construction() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());
        log.append(record("old")).expect("append");

        let mut reader = log.reader().expect("reader");
        log.append(record("new")).expect("append");

        let mut data = Vec::new();
        reader.read_to_end(&mut data).expect("read_to_end");
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&data[..8]);
        let len = u64::from_be_bytes(len_buf) as usize;
        assert_eq!(data.len(), 8 + len);
    }

    // ---------------------------------------------------------------
    // Reopen / reset
    // ---------------------------------------------------------------

    #[test]
    fn test_reopen_preserves_offsets() {
        let dir = TempDir::new().expect("create temp dir");
        let config = SegmentConfig {
            max_store_bytes: 4096,
            max_index_bytes: 3 * 12,
            initial_offset: 0,
        };

        let log = open_log(dir.path(), config.clone());
        for i in 0..7 {
            log.append(record(&format!("rec-{i}"))).expect("append");
        }
        let highest = log.highest_offset().expect("highest");
        log.close().expect("close");
        drop(log);

        let reopened = open_log(dir.path(), config);
        assert_eq!(reopened.lowest_offset().expect("lowest"), 0);
        assert_eq!(reopened.highest_offset().expect("highest"), highest);
        for i in 0..=highest {
            assert_eq!(
                reopened.read(i).expect("read").value,
                Bytes::copy_from_slice(format!("rec-{i}").as_bytes())
            );
        }
    }

    #[test]
    fn test_reset_to_offset_seeds_fresh_log() {
        let dir = TempDir::new().expect("create temp dir");
        let log = open_log(dir.path(), SegmentConfig::default());
        for value in ["a", "b"] {
            log.append(record(value)).expect("append");
        }

        log.reset_to_offset(40).expect("reset");
        assert!(matches!(log.read(0), Err(Error::OffsetOutOfRange { .. })));
        assert_eq!(log.append(record("fresh")).expect("append"), 40);
        assert_eq!(log.lowest_offset().expect("lowest"), 40);
    }
}
