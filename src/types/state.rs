//! Store lifecycle and client status

use serde::Serialize;

use super::LeaseState;

/// Lifecycle of one client's store handle
///
/// ```text
/// Cold -> Restoring -> Reopening -> Ready
/// Cold -> Bootstrapping -> Ready
/// ```
///
/// `Restoring` and `Reopening` may fall back to `Bootstrapping` when the
/// snapshot turns out to be unusable. `Ready` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Cold,
    Restoring,
    Reopening,
    Bootstrapping,
    Ready,
}

impl StoreState {
    pub fn can_transition_to(self, next: StoreState) -> bool {
        use StoreState::*;
        matches!(
            (self, next),
            (Cold, Restoring)
                | (Cold, Bootstrapping)
                | (Restoring, Reopening)
                | (Restoring, Bootstrapping)
                | (Reopening, Ready)
                | (Reopening, Bootstrapping)
                | (Bootstrapping, Ready)
        )
    }
}

/// Point-in-time status of a client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub client_id: String,
    pub store: String,
    pub state: StoreState,
    pub lease: LeaseState,
    /// A replayed statement failed; the replica no longer matches the leader
    pub diverged: bool,
    /// Local changes not yet captured by a durable snapshot
    pub unsynced: bool,
    pub replays_applied: u64,
    pub replays_failed: u64,
    pub last_persist_at_millis: Option<i64>,
}

/// Fired after a replicated statement has been applied locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
    pub origin: String,
    pub operation_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_is_terminal() {
        for next in [
            StoreState::Cold,
            StoreState::Restoring,
            StoreState::Reopening,
            StoreState::Bootstrapping,
            StoreState::Ready,
        ] {
            assert!(!StoreState::Ready.can_transition_to(next));
        }
    }

    #[test]
    fn test_restore_path() {
        assert!(StoreState::Cold.can_transition_to(StoreState::Restoring));
        assert!(StoreState::Restoring.can_transition_to(StoreState::Reopening));
        assert!(StoreState::Reopening.can_transition_to(StoreState::Ready));
        assert!(!StoreState::Cold.can_transition_to(StoreState::Ready));
        assert!(!StoreState::Cold.can_transition_to(StoreState::Reopening));
    }
}
