//! Memory-mapped offset index.
//!
//! The index maps a record's offset, relative to the segment's base, to
//! the position of its entry in the store file. Entries are fixed width
//! with no framing:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┐
//! │ rel_offset (4, BE)   │ store_pos (8, BE)    │
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! Relative offsets keep entries at 4 bytes; a segment would need 2^32
//! records before they overflow, and segment size caps keep counts far
//! below that.
//!
//! A memory-mapped file cannot grow through the mapping, so the file is
//! sized to `max_index_bytes` up front and `size` tracks the populated
//! prefix. On close the file is truncated back to `size`; reopening after
//! a clean shutdown therefore recovers the exact entry count from the
//! physical file length. A file found at its full mapped size signals an
//! unclean shutdown and the owning segment re-validates the tail.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::config::LogConfig;
use crate::error::{Error, Result};

pub(crate) const OFF_WIDTH: u64 = 4;
pub(crate) const POS_WIDTH: u64 = 8;
pub(crate) const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

/// Fixed-width, memory-mapped index over one segment's store.
pub struct Index {
    file: File,
    path: PathBuf,
    mmap: MmapMut,
    size: u64,
}

impl Index {
    /// Open or create the index file at `path`, sizing it to the
    /// configured maximum before mapping.
    pub fn open(path: impl AsRef<Path>, config: &LogConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        file.set_len(config.segment.max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            path,
            mmap,
            size,
        })
    }

    /// Read entry `at`, or the last entry when `at` is -1. Returns the
    /// relative offset and store position, or `EndOfIndex` when the index
    /// is empty or `at` is past the populated entries.
    pub fn read(&self, at: i64) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(Error::EndOfIndex);
        }
        let ent = if at == -1 {
            self.size / ENT_WIDTH - 1
        } else {
            at as u64
        };
        let pos = ent * ENT_WIDTH;
        if self.size < pos + ENT_WIDTH {
            return Err(Error::EndOfIndex);
        }

        let mut off_buf = [0u8; OFF_WIDTH as usize];
        off_buf.copy_from_slice(&self.mmap[pos as usize..(pos + OFF_WIDTH) as usize]);
        let mut pos_buf = [0u8; POS_WIDTH as usize];
        pos_buf.copy_from_slice(&self.mmap[(pos + OFF_WIDTH) as usize..(pos + ENT_WIDTH) as usize]);

        Ok((u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf)))
    }

    /// Append an entry. Returns `EndOfIndex`, without mutating state, when
    /// the mapped region has no room left.
    pub fn write(&mut self, off: u32, pos: u64) -> Result<()> {
        if (self.mmap.len() as u64) < self.size + ENT_WIDTH {
            return Err(Error::EndOfIndex);
        }
        let at = self.size as usize;
        self.mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        self.mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());
        self.size += ENT_WIDTH;
        Ok(())
    }

    /// True when the next write would overflow the mapping.
    pub fn is_maxed(&self) -> bool {
        (self.mmap.len() as u64) < self.size + ENT_WIDTH
    }

    /// Bytes of populated entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Discard everything past the first `entries` entries. Used by crash
    /// recovery after the store tail has been validated.
    pub(crate) fn truncate_entries(&mut self, entries: u64) {
        self.size = entries * ENT_WIDTH;
    }

    /// Sync the mapping and shrink the file to the populated prefix so a
    /// reopen recovers the true tail from the file length.
    pub fn close(self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        Ok(())
    }
}
