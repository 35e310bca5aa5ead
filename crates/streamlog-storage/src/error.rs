//! Error types for the log engine.
//!
//! ## Error Categories
//!
//! ### Bounds Errors
//! - `OffsetOutOfRange`: a read asked for an offset no segment covers. The
//!   attempted offset is carried so callers can retry or tail.
//! - `EndOfIndex`: an index read ran past the populated entries, or an
//!   index write would overflow the mapped region.
//!
//! ### Systems Errors
//! - `Io`: an underlying file operation failed
//! - `Decode`: stored bytes did not decode as a record
//!
//! ## Usage
//!
//! All operations return `Result<T>` which is aliased to
//! `Result<T, Error>`, allowing clean propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("end of index")]
    EndOfIndex,

    #[error("record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("log is closed")]
    Closed,
}
