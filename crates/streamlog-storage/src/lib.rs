//! Streamlog Storage Layer
//!
//! This crate implements the on-disk log engine: the durable,
//! offset-addressed record store every node serves reads from and the
//! replicated layer commits into.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐
//! │            Log               │  ordered list of segments,
//! │  append → active segment     │  routes reads by offset
//! └───────────┬──────────────────┘
//!             │
//! ┌───────────▼──────────────────┐
//! │          Segment             │  one store/index pair,
//! │  assigns offsets in order    │  rolls when either file fills
//! └─────┬───────────────┬────────┘
//!       │               │
//! ┌─────▼─────┐   ┌─────▼─────┐
//! │   Store   │   │   Index   │
//! │ len-prefix│   │ mmap, 12B │
//! │ byte file │   │  entries  │
//! └───────────┘   └───────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Store
//! Append-only byte file. Every entry is `[u64 big-endian length][payload]`;
//! writes are buffered, reads flush first.
//!
//! ### Index
//! Memory-mapped map from relative offset to store position. Fixed
//! 12-byte entries, file pre-sized to its cap, truncated to the populated
//! prefix on clean close.
//!
//! ### Segment
//! Pairs one store with one index under a shared base offset and hands
//! out offsets sequentially.
//!
//! ### Log
//! Composes segments: appends to the newest, reads from whichever covers
//! the offset, truncates old segments, streams its bytes for snapshots.
//!
//! ## Usage Example
//!
//! ```ignore
//! use streamlog_storage::{Log, LogConfig};
//! use streamlog_proto::v1::Record;
//!
//! let log = Log::open("/var/lib/streamlog", LogConfig::default())?;
//! let offset = log.append(Record {
//!     value: "hello".into(),
//!     ..Default::default()
//! })?;
//! let record = log.read(offset)?;
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod segment;
pub mod store;

pub use config::{LogConfig, SegmentConfig};
pub use error::{Error, Result};
pub use log::{Log, LogReader};
pub use segment::Segment;
pub use store::Store;
