//! Error taxonomy for the replication layer
//!
//! Init and bootstrap failures are fatal and reach whoever called
//! `Client::open_store`. Replication and persistence failures are
//! recovered locally: logged, flagged on the client status, never
//! propagated through the write path.

use thiserror::Error;

use crate::types::StoreState;

/// Result type for replication layer operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the replication layer
#[derive(Debug, Error)]
pub enum SyncError {
    /// No store creator emerged within the bounded wait
    #[error("init race for store '{store}' timed out after {attempts} attempts")]
    InitRaceTimeout { store: String, attempts: u32 },

    /// A migration statement failed; `index` is 1-based across all scripts
    #[error("schema bootstrap failed at statement {index} ({reason}): {statement}")]
    SchemaBootstrapFailure {
        index: usize,
        statement: String,
        reason: String,
    },

    /// Snapshot import failed or produced an unusable handle
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// A follower could not re-apply a broadcast statement
    #[error("failed to apply replicated '{tag}' from {origin}: {reason}")]
    ReplicationApplyFailure {
        origin: String,
        tag: String,
        reason: String,
    },

    /// Checkpoint, export, or slot write failed
    #[error("durable persist failed: {0}")]
    DurablePersistFailure(String),

    /// The oracle never reported a leader within the bound
    #[error("no leadership decision within {0} ms")]
    LeadershipTimeout(u64),

    #[error("invalid store transition {from:?} -> {to:?}")]
    InvalidTransition { from: StoreState, to: StoreState },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("slot store error: {0}")]
    SlotStore(String),

    #[error("client has been shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Engine(e.to_string())
    }
}

impl SyncError {
    /// Fatal errors leave the store unusable and must reach the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InitRaceTimeout { .. }
                | SyncError::SchemaBootstrapFailure { .. }
                | SyncError::LeadershipTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_failure_names_statement() {
        let err = SyncError::SchemaBootstrapFailure {
            index: 3,
            statement: "CREATE TABLE broken(".to_string(),
            reason: "incomplete input".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("statement 3"));
        assert!(text.contains("CREATE TABLE broken("));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recoverable_errors_are_not_fatal() {
        assert!(!SyncError::DurablePersistFailure("disk full".into()).is_fatal());
        assert!(!SyncError::SnapshotCorrupt("bad header".into()).is_fatal());
    }
}
