//! Data types shared across the replication layer
//!
//! This module contains the values that cross component boundaries:
//! bound parameters, channel messages, lease projections, snapshot
//! records and lifecycle state.

mod lease;
mod message;
mod scalar;
mod snapshot;
mod state;

pub use lease::{LeaderInfo, LeaseState};
pub use message::{operation_tag_for, InitKind, InitMessage, WriteMessage};
pub use scalar::ScalarValue;
pub use snapshot::{PersistOutcome, SnapshotHeader, SnapshotRecord, SNAPSHOT_HEADER_VERSION};
pub use state::{ClientStatus, RefreshEvent, StoreState};

/// Rows returned by a query, one `Vec<ScalarValue>` per row
pub type Rows = Vec<Vec<ScalarValue>>;
