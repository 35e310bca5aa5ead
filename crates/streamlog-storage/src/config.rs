//! Log Configuration
//!
//! Controls how segments are sized and where a fresh log starts:
//!
//! - **max_store_bytes**: roll to a new segment once the store file
//!   reaches this size (default: 1024)
//! - **max_index_bytes**: size the memory-mapped index file to this many
//!   bytes; the segment also rolls when the index fills (default: 1024)
//! - **initial_offset**: base offset of the first segment of a fresh log
//!   (default: 0)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub segment: SegmentConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Maximum store file size in bytes before rolling. Zero means the
    /// default of 1024.
    #[serde(default)]
    pub max_store_bytes: u64,

    /// Index file size in bytes. The index file is pre-sized to exactly
    /// this length, so it also caps the records a segment can hold. Zero
    /// means the default of 1024.
    #[serde(default)]
    pub max_index_bytes: u64,

    /// Base offset for the first segment of a freshly created log.
    #[serde(default)]
    pub initial_offset: u64,
}
