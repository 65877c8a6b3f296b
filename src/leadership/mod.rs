//! Leadership consumption
//!
//! The election algorithm itself is external: this layer only consumes a
//! [`LeadershipOracle`]. [`LeadershipTracker`] turns the oracle's
//! notifications into ordered, de-duplicated role-change callbacks.

mod lease;
mod tracker;

use tokio::sync::broadcast;

use crate::types::{LeaderInfo, LeaseState};

pub use lease::{LeaseRegistry, LocalLeaseOracle};
pub use tracker::{LeadershipTracker, RoleCallback};

/// Capability handed to a client by the election mechanism
pub trait LeadershipOracle: Send + Sync {
    /// Identity of the client this oracle speaks for
    fn client_id(&self) -> &str;

    fn is_leader(&self) -> bool;

    /// Current lease holder, `None` when unknown or unreachable
    fn leader_info(&self) -> Option<LeaderInfo>;

    /// Every role change for this client, in order
    fn subscribe(&self) -> broadcast::Receiver<LeaseState>;

    /// Toggle acceptance of writes that originate from another client
    fn set_accept_external_writes(&self, accept: bool);

    /// Leave the election; a leader hands its lease to the next candidate
    fn resign(&self);

    /// Current state as seen by this client
    fn lease_state(&self) -> LeaseState {
        match self.leader_info() {
            Some(info) => LeaseState {
                is_leader: self.is_leader(),
                leader_id: Some(info.leader_id),
            },
            None => LeaseState::unknown(),
        }
    }
}
