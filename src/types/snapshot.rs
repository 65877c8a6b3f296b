//! Durable snapshot record

use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

/// The latest full export of a store, one per logical database name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub bytes: Vec<u8>,
    pub written_at_millis: i64,
}

impl SnapshotRecord {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            written_at_millis: now_millis(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn header(&self) -> SnapshotHeader {
        SnapshotHeader {
            written_at_millis: self.written_at_millis,
            length: self.bytes.len() as u64,
            version: SNAPSHOT_HEADER_VERSION,
        }
    }
}

/// Current on-disk header version for slot files
pub const SNAPSHOT_HEADER_VERSION: u32 = 1;

/// First line of a slot file; the raw export follows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHeader {
    pub written_at_millis: i64,
    pub length: u64,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    SNAPSHOT_HEADER_VERSION
}

/// Result of a persist attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Snapshot written; carries its size in bytes
    Written(usize),
    /// Client is not the leader, nothing written
    NotLeader,
}
